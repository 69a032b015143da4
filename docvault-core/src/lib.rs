pub mod autosave;
pub mod codec;
pub mod config;
pub mod coordination;
pub mod deadlock;
pub mod document;
pub mod error;
pub mod events;
pub mod fsutil;
pub mod queue;
pub mod relay;
pub mod token;

pub use codec::{FormatCodec, JsonCodec, PlainTextCodec, Representation};
pub use config::DocumentConfig;
pub use coordination::{CoordinationService, FilePresenter, FileVersion, LocalCoordinator};
pub use document::{
    ChangeKind, ChangeRecorder, Document, DocumentBuilder, DocumentChange, DocumentState,
    SaveOperation,
};
pub use error::{DocumentError, Result, TokenError};
pub use events::{DocumentEvent, EventBus};
pub use token::{AttributeSet, ChangeToken, TokenAttribute};
