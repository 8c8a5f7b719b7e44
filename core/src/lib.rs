//! Synchronous client for the qdbapi hosted-database HTTP API.
//!
//! # Overview
//! `QuickBaseClient` builds `ApiCall` values and parses `Response` values
//! without touching the network. A `Session` binds those calls to an
//! authentication ticket and runs them over a `Transport`; `UreqTransport`
//! is the blocking network implementation.
//!
//! # Design
//! - `QuickBaseClient` is stateless; it holds only the base URL.
//! - Each operation is split into `build_*` (produces a call) and `parse_*`
//!   (consumes a response), so the I/O boundary is explicit and the wire
//!   format can be tested from fixtures alone.
//! - `Session` owns the ticket and signs out exactly once, either explicitly
//!   or on drop.
//! - Types are defined independently from the mock-server crate; integration
//!   tests catch drift between the two.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod request;
pub mod response;
pub mod session;
pub mod transport;
pub mod types;
pub mod xml;

pub use client::QuickBaseClient;
pub use config::ClientOptions;
pub use error::{Error, ErrorClass, ErrorCode, Result};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use request::{Action, ApiCall, Param, ParamValue, MAIN_DBID};
pub use response::Response;
pub use session::{with_session, Credentials, Session};
pub use transport::{Transport, UreqTransport};
pub use types::{
    AccessLevel, AddedField, ChildTable, CreatedDatabase, CsvImport, DatabaseSummary, DbId, DbInfo, EditedRecord,
    FieldDescriptor, FieldId, FieldProperties, FieldRef, FieldType, FieldValue, FieldValues, ImportSummary, PageRef,
    PageType, Permission, Query, QueryDef, QueryResult, Record, RecordField, RecordId, RecordInfo, RecordRef,
    ResultsFormat, Schema, SignedIn, Ticket, UpdateId,
};
