// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Shared server state.

use std::path::PathBuf;
use std::sync::Arc;

use tsrec_core::types::Participant;
use tsrec_engine::{ChannelSource, ClientId, Recorder};

/// State shared by all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub recorder: Arc<Recorder>,
    /// Canonicalized recording root; the anchor for path-escape checks.
    pub root: PathBuf,
}

impl AppState {
    pub fn new(recorder: Arc<Recorder>) -> Self {
        let root = recorder
            .root()
            .canonicalize()
            .unwrap_or_else(|_| recorder.root().to_path_buf());
        Self { recorder, root }
    }
}

/// Placeholder channel source for running the server without a voice client
/// attached; the bot integration installs its own implementation.
#[derive(Default)]
pub struct DetachedChannelSource;

impl ChannelSource for DetachedChannelSource {
    fn identity(&self, _client: ClientId) -> Option<Participant> {
        None
    }

    fn in_bot_channel(&self, _client: ClientId) -> bool {
        false
    }

    fn channel_clients(&self) -> Vec<Participant> {
        Vec::new()
    }
}
