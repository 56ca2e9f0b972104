// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Live-follow semantics over the HTTP surface: the open segment streams its
//! header pages first, then newly appended pages, and the stream ends cleanly
//! once the segment is finalized.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use http_body_util::BodyExt;
use tower::ServiceExt;

use tsrec_core::types::Participant;
use tsrec_engine::{ChannelSource, ClientId, Recorder, RecorderConfig};
use tsrec_index::RecordingIndex;
use tsrec_server::server::build_router;
use tsrec_server::state::AppState;

struct OneUserChannel {
    clients: Mutex<Vec<(ClientId, Participant)>>,
}

impl ChannelSource for OneUserChannel {
    fn identity(&self, client: ClientId) -> Option<Participant> {
        self.clients.lock().unwrap().iter().find(|(id, _)| *id == client).map(|(_, p)| p.clone())
    }

    fn in_bot_channel(&self, client: ClientId) -> bool {
        self.identity(client).is_some()
    }

    fn channel_clients(&self) -> Vec<Participant> {
        self.clients.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_follow_open_segment_until_finalize() {
    let root = tempfile::tempdir().unwrap();
    let source = Arc::new(OneUserChannel {
        clients: Mutex::new(vec![(
            1,
            Participant { uid: "uid-a".to_string(), name: "Alice".to_string() },
        )]),
    });
    let index = Arc::new(RecordingIndex::open_in_memory().unwrap());
    let recorder = Recorder::new(
        RecorderConfig {
            bot_id: 1,
            root: root.path().to_path_buf(),
            enabled: true,
            bitrate_kbps: 48,
            stop_delay: Duration::from_secs(30),
            min_duration: Duration::ZERO,
            max_total_size: None,
            exclude_uids: Vec::new(),
        },
        index,
        source,
    );
    recorder.on_connected();
    recorder.spawn_tick();

    // Give the recorder time to flush at least one data page.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let file_id = recorder.current_file_id().expect("segment is open");

    let app = build_router(AppState::new(recorder.clone()));
    let response = app
        .oneshot(
            axum::http::Request::builder()
                .uri(format!("/api/recording/get/{file_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "audio/ogg");
    assert_eq!(response.headers()["x-accel-buffering"], "no");

    // Collect the stream in the background while the recorder keeps going,
    // then finalize; the follow loop must end the stream on its own.
    let collect = tokio::spawn(async move { response.into_body().collect().await });
    tokio::time::sleep(Duration::from_millis(600)).await;
    recorder.set_enabled(false);

    let collected = tokio::time::timeout(Duration::from_secs(5), collect)
        .await
        .expect("stream ends after finalize")
        .unwrap()
        .unwrap()
        .to_bytes();

    // Header pages came first: OpusHead then OpusTags at the stream head.
    assert_eq!(&collected[..4], b"OggS");
    assert_eq!(&collected[28..36], b"OpusHead");
    assert!(collected.windows(8).any(|w| w == b"OpusTags"));

    recorder.dispose();
}
