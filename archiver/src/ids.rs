//! Strongly-typed identifiers, mirroring `RestreamId`/`InputId`/`OutputId`
//! in the old reactive-state module: thin wrappers so a row id can never be
//! silently swapped for an unrelated integer at a call site.

use derive_more::{AsRef, Deref, Display, From, Into};

/// Internal auto-incrementing row id of a `vods` row.
///
/// Distinct from [`UpstreamVodId`]: this one never changes for a row, even
/// across reconciliation (which only renames the upstream id).
#[derive(
    Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd,
)]
pub struct VodRowId(pub i64);

/// The upstream-platform VOD identifier, or a synthetic `live-<unix-seconds>`
/// placeholder id while a live session is being recorded.
#[derive(AsRef, Clone, Debug, Deref, Display, Eq, From, Hash, Into, PartialEq)]
#[as_ref(forward)]
pub struct UpstreamVodId(pub String);

impl UpstreamVodId {
    /// Builds the synthetic placeholder id used while a live session has no
    /// upstream VOD id yet.
    #[must_use]
    pub fn placeholder(observed_start_unix: i64) -> Self {
        Self(format!("live-{observed_start_unix}"))
    }

    /// Whether this id is a synthetic placeholder rather than a real
    /// upstream-assigned id.
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with("live-")
    }
}

/// Internal auto-incrementing row id of a `chat_messages` row.
#[derive(Clone, Copy, Debug, Display, Eq, From, Hash, Into, Ord, PartialEq, PartialOrd)]
pub struct ChatMessageId(pub i64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_id_is_recognized() {
        let id = UpstreamVodId::placeholder(1_700_000_000);
        assert_eq!(id.as_ref(), "live-1700000000");
        assert!(id.is_placeholder());
        assert!(!UpstreamVodId("123456".into()).is_placeholder());
    }
}
