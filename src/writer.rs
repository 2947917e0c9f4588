//! Erase and write flash through a [ChipClient]
//!
//! A failed write is not rolled back and cannot be resumed: the flash holds
//! whatever reached it, and the only recovery is a full erase and rewrite.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};

use crate::{
    error::Error,
    flash_data::{validate_layout, FlashParameters},
    flasher::{ChipClient, ProgressCallbacks},
};

/// Erase the entire flash chip
pub fn erase<C: ChipClient + ?Sized>(client: &mut C) -> Result<(), Error> {
    info!("Erasing flash");

    client.erase_flash().map_err(|e| match e {
        Error::Cancelled => e,
        e => Error::Erase(Box::new(e)),
    })
}

/// Write every segment of `params`, in order
///
/// Failures carry the offset of the segment being written. Once `cancel` is
/// set no further segment is started.
pub fn write<C: ChipClient + ?Sized>(
    client: &mut C,
    params: &FlashParameters,
    verify: bool,
    progress: &mut Option<&mut dyn ProgressCallbacks>,
    cancel: &AtomicBool,
) -> Result<(), Error> {
    validate_layout(&params.segments, params.size)?;

    let first = params.segments.first().map(|s| s.addr).unwrap_or_default();
    client
        .begin_flash(verify)
        .map_err(|e| Error::write_at(first, e))?;

    for segment in &params.segments {
        if cancel.load(Ordering::SeqCst) {
            return Err(Error::Cancelled);
        }

        debug!("Writing segment {:?}", segment);
        client
            .write_segment(segment, progress)
            .map_err(|e| Error::write_at(segment.addr, e))?;
    }

    let last = params.segments.last().map(|s| s.addr).unwrap_or_default();
    client.end_flash().map_err(|e| Error::write_at(last, e))?;

    info!(
        "Wrote {} bytes in {} segment(s)",
        params.total_size(),
        params.segments.len()
    );

    Ok(())
}

/// Reset the device into its application
pub fn hard_reset<C: ChipClient + ?Sized>(client: &mut C) -> Result<(), Error> {
    client.hard_reset()
}
