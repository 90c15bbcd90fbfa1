// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Process-wide transfer accounting.
//!
//! Both transfer paths (main channel and multifd) add to one counter so
//! the migration engine can report overall progress for the device class.
//! The engine resets it at migration start.

use std::sync::atomic::{AtomicU64, Ordering};

static BYTES_TRANSFERRED: AtomicU64 = AtomicU64::new(0);

/// Total device state bytes sent since the last reset.
pub fn bytes_transferred() -> u64 {
    BYTES_TRANSFERRED.load(Ordering::Relaxed)
}

/// Reset the transfer counter. Called at migration lifecycle boundaries.
pub fn reset_bytes_transferred() {
    BYTES_TRANSFERRED.store(0, Ordering::Relaxed);
}

pub(crate) fn add_bytes_transferred(n: u64) {
    BYTES_TRANSFERRED.fetch_add(n, Ordering::Relaxed);
}
