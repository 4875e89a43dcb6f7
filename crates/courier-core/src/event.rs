//! Direct-message event helpers using the nostr crate.
//!
//! The bus only handles two event kinds: profile metadata (kind 0) and
//! encrypted direct messages (kind 4). This module provides the validation
//! and addressing checks the inbound pipeline applies to DM events:
//! - Signature verification (Schnorr over secp256k1, via the nostr crate)
//! - Recipient check (`p` tag matching our public key)

use crate::error::{Error, Result};
use nostr::{Event, PublicKey};

/// Verifies the event ID and signature of a Nostr event.
///
/// The nostr crate checks both that the ID is the correct SHA-256 of the
/// canonical serialization and that the signature is valid over the ID.
///
/// # Errors
///
/// Returns [`Error::InvalidSignature`] if either check fails.
pub fn verify_event(event: &Event) -> Result<()> {
    event
        .verify()
        .map_err(|e| Error::InvalidSignature(e.to_string()))
}

/// Returns `true` if the event carries a `p` tag naming the given key.
///
/// Encrypted DMs address their recipient through a `p` tag whose second
/// element is the recipient's public key in hex.
pub fn is_addressed_to(event: &Event, recipient: &PublicKey) -> bool {
    let recipient_hex = recipient.to_hex();
    for tag in event.tags.iter() {
        let tag_vec: Vec<&str> = tag.as_slice().iter().map(|s| s.as_str()).collect();
        if tag_vec.first() == Some(&"p") && tag_vec.get(1) == Some(&recipient_hex.as_str()) {
            return true;
        }
    }
    false
}
