use crate::event::{Event, EventError};
use sha2::{Digest, Sha256};

/// Field separator for the canonical identity string. An ASCII unit separator
/// cannot appear in well-formed principal ids or event types, so distinct
/// field tuples never collide on concatenation.
const IDENTITY_DELIMITER: u8 = 0x1f;

/// Derives the deterministic dedup key for an event.
///
/// Canonical form: `principal_id \x1f event_type \x1f epoch_ms`, hashed with
/// SHA-256 and rendered as lowercase hex. The digest only needs to avoid
/// accidental collisions; it bounds key/index size regardless of how long the
/// natural identity fields grow. Pure: same event, same key, across process
/// restarts and re-deliveries.
pub fn derive(event: &Event) -> Result<String, EventError> {
    if event.principal_id().is_empty() {
        return Err(EventError::MissingField {
            field: "principal_id",
        });
    }
    if event.event_type().is_empty() {
        return Err(EventError::MissingField {
            field: "event_type",
        });
    }
    let mut hasher = Sha256::new();
    hasher.update(event.principal_id().as_bytes());
    hasher.update([IDENTITY_DELIMITER]);
    hasher.update(event.event_type().as_bytes());
    hasher.update([IDENTITY_DELIMITER]);
    hasher.update(event.event_timestamp().epoch_ms().to_be_bytes());
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        encoded.push_str(&format!("{:02x}", byte));
    }
    encoded
}
