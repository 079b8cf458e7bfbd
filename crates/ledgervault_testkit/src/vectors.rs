//! Canonical signing payload vectors.
//!
//! Any client implementation must produce these exact byte strings before
//! signing, or the server will reject its requests.

/// A signing payload vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningVector {
    /// Unique identifier for this vector.
    pub id: &'static str,
    /// Request method as sent.
    pub method: &'static str,
    /// Request path.
    pub path: &'static str,
    /// Request body.
    pub body: &'static [u8],
    /// Signature timestamp.
    pub timestamp_ms: u64,
    /// Expected canonical payload.
    pub expected: &'static str,
}

/// Request signing vectors.
pub fn signing_vectors() -> Vec<SigningVector> {
    vec![
        SigningVector {
            id: "empty_body",
            method: "POST",
            path: "/rpc/user.get",
            body: b"",
            timestamp_ms: 1_700_000_000_000,
            expected: "LEDGERVAULT-V1\nPOST\n/rpc/user.get\n1700000000000\n\
                       e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        },
        SigningVector {
            id: "lowercase_method",
            method: "post",
            path: "/rpc/sync.append",
            body: b"ledgervault",
            timestamp_ms: 42,
            expected: "LEDGERVAULT-V1\nPOST\n/rpc/sync.append\n42\n\
                       3f64ab6091507f06b23a9d9935df8c05d4f0bff49881361f088a91a2c70983c2",
        },
        SigningVector {
            id: "realtime_get",
            method: "GET",
            path: "/realtime/00000000-0000-0000-0000-000000000000",
            body: b"{}",
            timestamp_ms: 0,
            expected: "LEDGERVAULT-V1\nGET\n/realtime/00000000-0000-0000-0000-000000000000\n0\n\
                       44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a",
        },
    ]
}
