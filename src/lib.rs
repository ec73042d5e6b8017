//! # tandem — real-time collaborative document core
//!
//! Server-side per-document control plus the client-side sync machine of
//! a multi-user rich-text editing service, converging concurrent edits
//! with operational transformation.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  editor events   ┌────────────┐   JSON / WebSocket
//! │   editor   │ ◄──────────────► │ ClientSync │ ◄───────────────────┐
//! │  (widget)  │  apply changes   │  (machine) │                     │
//! └────────────┘                  └─────┬──────┘                     ▼
//!                                       │ SessionProxy         ┌───────────┐
//!                                       └─────────────────────►│ ApiServer │
//!                                                              └─────┬─────┘
//!                                                        targets     │
//!                                                              ┌─────▼─────┐
//!                                                              │  Session  │
//!                                                              └─────┬─────┘
//!                                 ┌────────────────────────────┬─────┴──────┐
//!                                 ▼                            ▼            ▼
//!                          BodyControl                PropertyControl  CaretControl
//!                                 │      (OT update / long poll)│            │
//!                                 └──────────────┬──────────────┘            │
//!                                                ▼                           │
//!                                       TransactionalFile ◄─────────────────┘
//!                                      (CAS append, /caret/* side channel)
//! ```
//!
//! ## Modules
//!
//! - [`delta`] — the OT algebra: body, caret, and property payloads
//! - [`storage`] — the transactional file (atomic multi-op transactions)
//! - [`doc`] — per-payload revision logs, the `update` rebase protocol,
//!   caret presence, and the document registry
//! - [`session`] — the (author, document, connection) binding
//! - [`api`] — request/response framing, codec, challenge-response auth
//! - [`client`] — the editor-facing sync state machine

pub mod api;
pub mod client;
pub mod delta;
pub mod doc;
pub mod session;
pub mod storage;

pub use api::{ApiClient, ApiError, ApiServer, Codec, ServerConfig, SessionProxy, TargetAuthority};
pub use client::{ClientConfig, ClientHandle, ClientSync, EditorEvent, EditorHandle, MemoryEditor};
pub use delta::{
    BodyDelta, Caret, CaretDelta, CaretSnapshot, Change, DeltaError, OtDelta, PropertyDelta,
    Snapshot, Timestamp,
};
pub use doc::{BodyControl, CaretControl, DocComplex, DocError, DocRegistry, PropertyControl};
pub use session::Session;
pub use storage::{FileError, FrozenBuffer, StoragePath, TransactionalFile};
