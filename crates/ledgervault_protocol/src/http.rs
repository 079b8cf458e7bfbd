//! Transport envelope: operations, requests, responses and error bodies.
//!
//! The RPC surface is method-agnostic; this crate maps each operation to a
//! `POST /rpc/<name>` route with a CBOR body, and realtime subscriptions to
//! `GET /realtime/<vault_id>`.

use crate::model::VaultId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Route prefix for RPC calls.
pub const RPC_PREFIX: &str = "/rpc/";

/// Route prefix for realtime subscriptions.
pub const REALTIME_PREFIX: &str = "/realtime/";

/// Operations of the logical RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcOperation {
    /// `vault.create`
    CreateVault,
    /// `vault.delete`
    DeleteVault,
    /// `membership.list`
    ListMembers,
    /// `membership.get`
    GetMembership,
    /// `membership.remove`
    RemoveMember,
    /// `membership.rekey`
    Rekey,
    /// `membership.leave`
    LeaveVault,
    /// `invite.create`
    CreateInvite,
    /// `invite.accept`
    AcceptInvite,
    /// `invite.list`
    ListInvites,
    /// `sync.append`
    AppendUpdate,
    /// `sync.fetchSince`
    FetchSince,
    /// `user.put`
    PutUserData,
    /// `user.get`
    GetUserData,
}

impl RpcOperation {
    /// Every operation.
    pub const ALL: [RpcOperation; 14] = [
        RpcOperation::CreateVault,
        RpcOperation::DeleteVault,
        RpcOperation::ListMembers,
        RpcOperation::GetMembership,
        RpcOperation::RemoveMember,
        RpcOperation::Rekey,
        RpcOperation::LeaveVault,
        RpcOperation::CreateInvite,
        RpcOperation::AcceptInvite,
        RpcOperation::ListInvites,
        RpcOperation::AppendUpdate,
        RpcOperation::FetchSince,
        RpcOperation::PutUserData,
        RpcOperation::GetUserData,
    ];

    /// Dotted operation name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            RpcOperation::CreateVault => "vault.create",
            RpcOperation::DeleteVault => "vault.delete",
            RpcOperation::ListMembers => "membership.list",
            RpcOperation::GetMembership => "membership.get",
            RpcOperation::RemoveMember => "membership.remove",
            RpcOperation::Rekey => "membership.rekey",
            RpcOperation::LeaveVault => "membership.leave",
            RpcOperation::CreateInvite => "invite.create",
            RpcOperation::AcceptInvite => "invite.accept",
            RpcOperation::ListInvites => "invite.list",
            RpcOperation::AppendUpdate => "sync.append",
            RpcOperation::FetchSince => "sync.fetchSince",
            RpcOperation::PutUserData => "user.put",
            RpcOperation::GetUserData => "user.get",
        }
    }

    /// Looks an operation up by its dotted name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|op| op.name() == name)
    }

    /// Route of this operation.
    #[must_use]
    pub fn path(self) -> String {
        format!("{RPC_PREFIX}{}", self.name())
    }

    /// Parses a route.
    #[must_use]
    pub fn from_path(path: &str) -> Option<Self> {
        path.strip_prefix(RPC_PREFIX).and_then(Self::from_name)
    }
}

impl fmt::Display for RpcOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Route of the realtime subscription for a vault.
#[must_use]
pub fn realtime_path(vault_id: &VaultId) -> String {
    format!("{REALTIME_PREFIX}{vault_id}")
}

/// An inbound request as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Header pairs. Lookup is case-insensitive.
    pub headers: Vec<(String, String)>,
    /// Raw body bytes.
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Creates a request without headers.
    pub fn new(method: impl Into<String>, path: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body,
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Adds several headers.
    #[must_use]
    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Returns the first header with the given name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A response produced by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// CBOR body: the operation reply on 200, an [`ErrorBody`] otherwise.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Returns true for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Machine-readable error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Missing, invalid or stale signature.
    Unauthorized,
    /// Authenticated but insufficient role.
    Forbidden,
    /// Vault or membership absent, or caller is not a member.
    NotFound,
    /// Malformed input or disallowed operation.
    BadRequest,
    /// The store failed; the operation may not have been applied.
    StorageFailure,
    /// Unexpected server fault.
    Internal,
}

impl ErrorKind {
    /// HTTP status code for this kind.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::BadRequest => 400,
            ErrorKind::StorageFailure | ErrorKind::Internal => 500,
        }
    }

    /// Maps a status code back to a kind.
    #[must_use]
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 => ErrorKind::Unauthorized,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            400..=499 => ErrorKind::BadRequest,
            _ => ErrorKind::Internal,
        }
    }
}

/// Structured error returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
}
