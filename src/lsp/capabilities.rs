//! Client capabilities we advertise and server capabilities we honor.

use lsp_types::{
    CallHierarchyServerCapability, ClientCapabilities, CodeActionProviderCapability,
    CompletionClientCapabilities, CompletionItemCapability, DeclarationCapability,
    DidChangeWatchedFilesClientCapabilities, DocumentSymbolClientCapabilities,
    DynamicRegistrationClientCapabilities, FoldingRangeProviderCapability,
    GeneralClientCapabilities, GotoCapability, HoverClientCapabilities, HoverProviderCapability,
    ImplementationProviderCapability, MarkupKind, OneOf, PublishDiagnosticsClientCapabilities,
    RenameClientCapabilities, RenameOptions, SelectionRangeProviderCapability, ServerCapabilities,
    ShowMessageRequestClientCapabilities, SignatureHelpClientCapabilities,
    TextDocumentClientCapabilities, TextDocumentSyncCapability, TextDocumentSyncClientCapabilities,
    TextDocumentSyncKind, TextDocumentSyncSaveOptions, TypeDefinitionProviderCapability,
    WindowClientCapabilities, WorkspaceClientCapabilities, WorkspaceEditClientCapabilities,
    WorkspaceSymbolClientCapabilities,
};

use super::position::OffsetEncoding;

/// Capabilities sent in `initialize`.
pub fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            apply_edit: Some(true),
            workspace_edit: Some(WorkspaceEditClientCapabilities {
                document_changes: Some(true),
                ..Default::default()
            }),
            did_change_configuration: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(false),
            }),
            did_change_watched_files: Some(DidChangeWatchedFilesClientCapabilities {
                dynamic_registration: Some(true),
                relative_pattern_support: Some(false),
            }),
            symbol: Some(WorkspaceSymbolClientCapabilities {
                dynamic_registration: Some(false),
                ..Default::default()
            }),
            execute_command: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(false),
            }),
            configuration: Some(true),
            workspace_folders: Some(true),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                dynamic_registration: Some(false),
                will_save: Some(true),
                will_save_wait_until: Some(true),
                did_save: Some(true),
            }),
            completion: Some(CompletionClientCapabilities {
                dynamic_registration: Some(false),
                completion_item: Some(CompletionItemCapability {
                    snippet_support: Some(false),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            hover: Some(HoverClientCapabilities {
                dynamic_registration: Some(false),
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
            }),
            signature_help: Some(SignatureHelpClientCapabilities {
                dynamic_registration: Some(false),
                ..Default::default()
            }),
            definition: Some(GotoCapability {
                dynamic_registration: Some(false),
                link_support: Some(false),
            }),
            references: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(false),
            }),
            document_highlight: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(false),
            }),
            document_symbol: Some(DocumentSymbolClientCapabilities {
                dynamic_registration: Some(false),
                hierarchical_document_symbol_support: Some(true),
                ..Default::default()
            }),
            formatting: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(true),
            }),
            rename: Some(RenameClientCapabilities {
                dynamic_registration: Some(false),
                prepare_support: Some(true),
                ..Default::default()
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
                related_information: Some(true),
                version_support: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        }),
        window: Some(WindowClientCapabilities {
            work_done_progress: Some(true),
            show_message: Some(ShowMessageRequestClientCapabilities::default()),
            ..Default::default()
        }),
        general: Some(GeneralClientCapabilities {
            position_encodings: Some(vec![
                OffsetEncoding::Utf16.to_lsp(),
                OffsetEncoding::Utf8.to_lsp(),
                OffsetEncoding::Utf32.to_lsp(),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Encoding the server picked; UTF-16 when it did not say.
pub fn negotiated_encoding(caps: &ServerCapabilities) -> OffsetEncoding {
    caps.position_encoding
        .as_ref()
        .and_then(OffsetEncoding::from_lsp)
        .unwrap_or_default()
}

/// Granularity of `didChange` notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncKind {
    /// The server wants no change notifications.
    #[default]
    None,
    /// Every change resends the whole text.
    Full,
    /// Changes are sent as ranged edits.
    Incremental,
}

impl SyncKind {
    fn from_lsp(kind: TextDocumentSyncKind) -> Self {
        if kind == TextDocumentSyncKind::FULL {
            SyncKind::Full
        } else if kind == TextDocumentSyncKind::INCREMENTAL {
            SyncKind::Incremental
        } else {
            SyncKind::None
        }
    }
}

/// Document sync behavior negotiated with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// How edits are reported.
    pub kind: SyncKind,
    /// Send `didOpen`/`didClose`.
    pub open_close: bool,
    /// Send `willSave`.
    pub will_save: bool,
    /// Send `willSaveWaitUntil` and apply the returned edits.
    pub will_save_wait_until: bool,
    /// Send `didSave`.
    pub save: bool,
    /// Include the text in `didSave`.
    pub include_text: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            kind: SyncKind::None,
            open_close: true,
            will_save: false,
            will_save_wait_until: false,
            save: true,
            include_text: false,
        }
    }
}

impl SyncSettings {
    /// Reads `textDocumentSync`. `didOpen`/`didClose` are sent unless the
    /// server explicitly turns them off.
    pub fn from_server(caps: &ServerCapabilities) -> Self {
        match &caps.text_document_sync {
            None => Self::default(),
            Some(TextDocumentSyncCapability::Kind(kind)) => Self {
                kind: SyncKind::from_lsp(*kind),
                ..Self::default()
            },
            Some(TextDocumentSyncCapability::Options(options)) => {
                let (save, include_text) = match &options.save {
                    None => (false, false),
                    Some(TextDocumentSyncSaveOptions::Supported(supported)) => (*supported, false),
                    Some(TextDocumentSyncSaveOptions::SaveOptions(save)) => {
                        (true, save.include_text.unwrap_or(false))
                    }
                };
                Self {
                    kind: options.change.map(SyncKind::from_lsp).unwrap_or_default(),
                    open_close: options.open_close.unwrap_or(true),
                    will_save: options.will_save.unwrap_or(false),
                    will_save_wait_until: options.will_save_wait_until.unwrap_or(false),
                    save,
                    include_text,
                }
            }
        }
    }
}

fn enabled<T>(field: Option<&OneOf<bool, T>>) -> bool {
    !matches!(field, None | Some(OneOf::Left(false)))
}

/// Whether the server advertised what `method` needs. Methods without a
/// provider field are always allowed.
pub fn supports(caps: &ServerCapabilities, method: &str) -> bool {
    match method {
        "textDocument/hover" => !matches!(
            caps.hover_provider,
            None | Some(HoverProviderCapability::Simple(false))
        ),
        "textDocument/completion" | "completionItem/resolve" => caps.completion_provider.is_some(),
        "textDocument/signatureHelp" => caps.signature_help_provider.is_some(),
        "textDocument/declaration" => !matches!(
            caps.declaration_provider,
            None | Some(DeclarationCapability::Simple(false))
        ),
        "textDocument/definition" => enabled(caps.definition_provider.as_ref()),
        "textDocument/typeDefinition" => !matches!(
            caps.type_definition_provider,
            None | Some(TypeDefinitionProviderCapability::Simple(false))
        ),
        "textDocument/implementation" => !matches!(
            caps.implementation_provider,
            None | Some(ImplementationProviderCapability::Simple(false))
        ),
        "textDocument/references" => enabled(caps.references_provider.as_ref()),
        "textDocument/documentHighlight" => enabled(caps.document_highlight_provider.as_ref()),
        "textDocument/documentSymbol" => enabled(caps.document_symbol_provider.as_ref()),
        "workspace/symbol" => enabled(caps.workspace_symbol_provider.as_ref()),
        "textDocument/codeAction" | "codeAction/resolve" => !matches!(
            caps.code_action_provider,
            None | Some(CodeActionProviderCapability::Simple(false))
        ),
        "textDocument/codeLens" | "codeLens/resolve" => caps.code_lens_provider.is_some(),
        "textDocument/formatting" => enabled(caps.document_formatting_provider.as_ref()),
        "textDocument/rangeFormatting" => {
            enabled(caps.document_range_formatting_provider.as_ref())
        }
        "textDocument/onTypeFormatting" => caps.document_on_type_formatting_provider.is_some(),
        "textDocument/rename" => enabled(caps.rename_provider.as_ref()),
        "textDocument/prepareRename" => matches!(
            caps.rename_provider,
            Some(OneOf::Right(RenameOptions {
                prepare_provider: Some(true),
                ..
            }))
        ),
        "workspace/executeCommand" => caps.execute_command_provider.is_some(),
        "textDocument/foldingRange" => !matches!(
            caps.folding_range_provider,
            None | Some(FoldingRangeProviderCapability::Simple(false))
        ),
        "textDocument/selectionRange" => !matches!(
            caps.selection_range_provider,
            None | Some(SelectionRangeProviderCapability::Simple(false))
        ),
        "textDocument/prepareCallHierarchy" => !matches!(
            caps.call_hierarchy_provider,
            None | Some(CallHierarchyServerCapability::Simple(false))
        ),
        _ => true,
    }
}
