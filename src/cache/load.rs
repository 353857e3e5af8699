//! Speculative-size load with checksum retry.
//!
//! The class gives a best-guess length; the read is clamped to the end of
//! allocation. If the class can refine the length from the bytes read, the
//! remainder (or a truncation) follows. A class with a checksum gets its
//! predicate run on the final image. A mismatch or a failed store read is
//! retried with exponential backoff up to `max_read_attempts` reads.

use std::any::Any;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::class::{EntryClass, LoadContext};
use crate::cache::entry::Address;
use crate::config::LoadConfig;
use crate::error::{CacheError, Result};
use crate::store::{BackingStore, StoreError};

/// A successfully loaded entry, not yet in the cache.
#[derive(Debug)]
pub(crate) struct Loaded {
    pub payload: Box<dyn Any + Send>,
    pub image: Vec<u8>,
    pub dirtied: bool,
    /// Reads of the full image, including the successful one.
    pub attempts: u32,
}

impl Loaded {
    pub fn size(&self) -> usize {
        self.image.len()
    }
}

enum Attempt {
    Verified(Vec<u8>),
    /// The image cannot be trusted; worth reading again.
    Corrupt(&'static str),
    /// The store failed the read; worth reading again.
    ReadFailed(StoreError),
}

pub(crate) fn load_entry<S: BackingStore + ?Sized>(
    store: &S,
    config: &LoadConfig,
    class: &dyn EntryClass,
    addr: Address,
    ctx: LoadContext<'_>,
) -> Result<Loaded> {
    let eoa = store.end_of_allocation();
    let guess = class
        .initial_load_size(addr, ctx)
        .map_err(|e| CacheError::class(addr, e))?;
    if guess == 0 {
        return Err(CacheError::InvalidResize { addr, size: 0 });
    }
    if addr >= eoa {
        return Err(CacheError::ReadPastEndOfAllocation {
            addr,
            len: guess,
            eoa,
        });
    }
    // Speculative reads must not run off the end of the file.
    let initial = guess.min((eoa.0 - addr.0) as usize);

    let max_attempts = config.max_read_attempts.max(1);
    let mut backoff = config.initial_backoff_us;
    let mut last_read_error = None;
    for attempt in 1..=max_attempts {
        match read_once(store, class, addr, initial, eoa, ctx)? {
            Attempt::Verified(image) => {
                let (payload, dirtied) = class
                    .deserialize(&image, addr, ctx)
                    .map_err(|e| CacheError::class(addr, e))?;
                debug!(
                    addr = %addr,
                    size = image.len(),
                    attempts = attempt,
                    class = class.name(),
                    "Loaded entry"
                );
                return Ok(Loaded {
                    payload,
                    image,
                    dirtied,
                    attempts: attempt,
                });
            }
            Attempt::Corrupt(reason) => {
                warn!(addr = %addr, attempt, max_attempts, reason, "Load verification failed");
                last_read_error = None;
            }
            Attempt::ReadFailed(e) => {
                warn!(addr = %addr, attempt, max_attempts, error = %e, "Load read failed");
                last_read_error = Some(e);
            }
        }
        if attempt < max_attempts {
            thread::sleep(Duration::from_micros(backoff));
            backoff = backoff.saturating_mul(2).min(config.max_backoff_us);
        }
    }
    match last_read_error {
        Some(e) => Err(e.into()),
        None => Err(CacheError::ChecksumFailureExhausted {
            addr,
            attempts: max_attempts,
        }),
    }
}

/// Read `buf` at `addr`. Out-of-bounds reads fail at once; any other store
/// error is reported for retry.
fn read_retryable<S: BackingStore + ?Sized>(
    store: &S,
    addr: Address,
    buf: &mut [u8],
) -> Result<Option<StoreError>> {
    match store.read(addr, buf) {
        Ok(()) => Ok(None),
        Err(e @ StoreError::OutOfBounds { .. }) => Err(e.into()),
        Err(e) => Ok(Some(e)),
    }
}

fn read_once<S: BackingStore + ?Sized>(
    store: &S,
    class: &dyn EntryClass,
    addr: Address,
    initial: usize,
    eoa: Address,
    ctx: LoadContext<'_>,
) -> Result<Attempt> {
    let mut image = vec![0u8; initial];
    if let Some(e) = read_retryable(store, addr, &mut image)? {
        return Ok(Attempt::ReadFailed(e));
    }

    let refined = class
        .final_load_size(&image, initial, ctx)
        .map_err(|e| CacheError::class(addr, e))?;
    if let Some(len) = refined {
        if len == 0 {
            return Err(CacheError::InvalidResize { addr, size: 0 });
        }
        if addr.0 + len as u64 > eoa.0 {
            // A length derived from a corrupt header is as suspect as the
            // rest of the image.
            if class.has_checksum() {
                return Ok(Attempt::Corrupt("final length past end of allocation"));
            }
            return Err(CacheError::ReadPastEndOfAllocation { addr, len, eoa });
        }
        if len > initial {
            image.resize(len, 0);
            if let Some(e) = read_retryable(store, addr.offset(initial), &mut image[initial..])? {
                return Ok(Attempt::ReadFailed(e));
            }
        } else {
            image.truncate(len);
        }
    }

    if class.has_checksum() && !class.verify_checksum(&image, ctx) {
        return Ok(Attempt::Corrupt("checksum mismatch"));
    }
    Ok(Attempt::Verified(image))
}
