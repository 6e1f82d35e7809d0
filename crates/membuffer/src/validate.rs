// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integrity checking of cached payloads.

use tracing::error;

use crate::error::{CodecError, Error, Result};
use crate::fingerprint::Fingerprint;
use crate::stats::SegmentStats;
use crate::store::{FingerprintStore, PayloadMut, StoreOutcome};

/// Bytes prepended to every payload: the owning fingerprint, then a digest of the payload.
const HEADER_LEN: usize = 32;

/// A store decorator that detects corrupted or misrouted payloads.
///
/// Every payload is stored behind a header carrying its fingerprint and a digest of its
/// bytes. Reads check both; an entry that fails the check is logged, dropped, and
/// reported as a miss. This costs a hash per read and write, so it is meant for
/// debugging and diagnostics rather than production.
///
/// # Examples
///
/// ```
/// use membuffer::{Fingerprint, Membuffer};
///
/// let cache = Membuffer::builder().total_size(1 << 20).build_validated()?;
/// let fingerprint = Fingerprint::of(b"key");
/// cache.store(fingerprint, b"value");
/// assert_eq!(cache.lookup(fingerprint).as_deref(), Some(&b"value"[..]));
/// # Ok::<(), membuffer::Error>(())
/// ```
#[derive(Debug)]
pub struct Validated<S> {
    inner: S,
}

#[derive(Debug, thiserror::Error)]
#[error("cached payload failed its integrity check")]
struct IntegrityError;

impl<S: FingerprintStore> Validated<S> {
    /// Wraps `inner`.
    pub const fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Returns the wrapped store.
    pub const fn inner(&self) -> &S {
        &self.inner
    }

    /// Drops the entry of `fingerprint` if it still fails the check under the write lock.
    fn reject(&self, fingerprint: Fingerprint) {
        let purged = self.inner.modify_in_place(fingerprint, |payload| match verify(fingerprint, payload.as_slice()) {
            Some(_) => Ok(()),
            None => Err(IntegrityError.into()),
        });

        if matches!(purged, Err(Error::Mutate(_))) {
            error!(fingerprint = %fingerprint, "cached payload failed its integrity check, entry dropped");
        }
    }
}

fn encode(fingerprint: Fingerprint, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&fingerprint.to_bytes());
    bytes.extend_from_slice(&Fingerprint::of(payload).to_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Returns the payload if `bytes` carries a valid header for `fingerprint`.
fn verify(fingerprint: Fingerprint, bytes: &[u8]) -> Option<&[u8]> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let (header, payload) = bytes.split_at(HEADER_LEN);
    let (tag, digest) = header.split_at(16);
    (tag == fingerprint.to_bytes() && digest == Fingerprint::of(payload).to_bytes()).then_some(payload)
}

impl<S: FingerprintStore> FingerprintStore for Validated<S> {
    fn max_item_size(&self) -> usize {
        self.inner.max_item_size().saturating_sub(HEADER_LEN)
    }

    fn lookup_into(&self, fingerprint: Fingerprint, out: &mut Vec<u8>) -> bool {
        if !self.inner.lookup_into(fingerprint, out) {
            return false;
        }

        if verify(fingerprint, out).is_none() {
            out.clear();
            self.reject(fingerprint);
            return false;
        }

        out.drain(..HEADER_LEN);
        true
    }

    fn lookup_with<R>(&self, fingerprint: Fingerprint, extract: impl FnOnce(&[u8]) -> R) -> Option<R> {
        match self
            .inner
            .lookup_with(fingerprint, |bytes| verify(fingerprint, bytes).map(extract))
        {
            Some(Some(result)) => Some(result),
            Some(None) => {
                self.reject(fingerprint);
                None
            }
            None => None,
        }
    }

    fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.inner.contains(fingerprint)
    }

    fn store(&self, fingerprint: Fingerprint, bytes: &[u8]) -> StoreOutcome {
        if bytes.len() > self.max_item_size() {
            self.inner.remove(fingerprint);
            return StoreOutcome::Rejected;
        }
        self.inner.store(fingerprint, &encode(fingerprint, bytes))
    }

    fn modify_in_place<F>(&self, fingerprint: Fingerprint, transform: F) -> Result<bool>
    where
        F: FnOnce(&mut PayloadMut<'_>) -> std::result::Result<(), CodecError>,
    {
        let result = self.inner.modify_in_place(fingerprint, |outer| {
            let bytes = outer.as_mut_slice();
            if verify(fingerprint, bytes).is_none() {
                return Err(IntegrityError.into());
            }

            let (header, body) = bytes.split_at_mut(HEADER_LEN);
            let mut view = PayloadMut::new(body);
            transform(&mut view)?;

            let replacement = match view.into_replacement() {
                Some(new_body) => Some(encode(fingerprint, &new_body)),
                None => {
                    header[16..].copy_from_slice(&Fingerprint::of(body).to_bytes());
                    None
                }
            };
            if let Some(bytes) = replacement {
                outer.replace(bytes);
            }
            Ok(())
        });

        match result {
            Err(Error::Mutate(source)) if source.is::<IntegrityError>() => {
                error!(fingerprint = %fingerprint, "cached payload failed its integrity check, entry dropped");
                Ok(false)
            }
            other => other,
        }
    }

    fn remove(&self, fingerprint: Fingerprint) -> bool {
        self.inner.remove(fingerprint)
    }

    fn clear(&self) {
        self.inner.clear();
    }

    fn stats(&self) -> SegmentStats {
        self.inner.stats()
    }
}
