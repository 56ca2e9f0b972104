// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! TSRec Engine - lifecycle coordination for channel recording.
//!
//! ## Modules
//!
//! - [`source`]: the seam to the voice client (identities, membership, events)
//! - [`segment`]: segment naming, collision handling and file removal
//! - [`recorder`]: the recording manager (mix tick, start/stop/rotate)
//! - [`recovery`]: startup finalization of orphaned `__open` segments
//! - [`quota`]: oldest-first eviction under a total-size budget

pub mod quota;
pub mod recorder;
pub mod recovery;
pub mod segment;
pub mod source;

pub use recorder::{Recorder, RecorderConfig};
pub use source::{ChannelEventBus, ChannelEvents, ChannelSource, ClientId, Subscription};
