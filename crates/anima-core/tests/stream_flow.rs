//! End-to-end flow over the pure pipeline pieces: segment a streamed
//! answer into frames, write them through the replay cache, and replay
//! them verbatim for the next identical request.

use anima_core::segment::SegmentOutput;
use anima_core::{cache_key, Frame, MemoryStore, ReplayCache, Segmenter, SessionStore, SuggestedSet};
use std::sync::Arc;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(60);

fn frames_for_answer(deltas: &[&str]) -> Vec<Frame> {
    let mut seg = Segmenter::new(20, vec!['.', '!', '?']);
    let mut outputs = Vec::new();
    for d in deltas {
        outputs.extend(seg.push_delta(d));
    }
    outputs.extend(seg.finish());
    outputs
        .into_iter()
        .map(|o| match o {
            SegmentOutput::Speak { display, .. } => Frame::message(&display, None),
            SegmentOutput::Link(link) => Frame::link(&link),
        })
        .collect()
}

#[tokio::test]
async fn generated_answer_replays_byte_for_byte() {
    let store = Arc::new(MemoryStore::new());
    let replay = ReplayCache::new(store, TTL, 2, TTL);
    let suggested = SuggestedSet::new(["what can you do"]);

    let key = cache_key("tenant", "u1", "v1", "what can you do?", &suggested);

    // First request: a miss, generated live and mirrored into the cache.
    assert!(replay.load(&key).await.unwrap().is_none());
    assert!(replay.try_lease(&key).await.unwrap());

    let frames = frames_for_answer(&[
        "I can answer questions and ",
        "show pictures. ",
        "Here is one: ![cat](http://img/c",
        "at.png) enjoy!",
    ]);
    assert!(frames.len() >= 2, "expected prose and link frames");

    let mut writer = replay.writer(&key).await;
    for f in &frames {
        writer.push(f).await;
    }
    writer.seal().await;
    replay.release_lease(&key).await.unwrap();

    // Second request from a different user hits the shared suggested entry.
    let key2 = cache_key("tenant", "someone-else", "v1", "What can you do？", &suggested);
    assert_eq!(key, key2);
    let replayed = replay.load(&key2).await.unwrap().unwrap();
    let wire: Vec<String> = replayed.iter().map(Frame::encode).collect();
    let expected: Vec<String> = frames.iter().map(Frame::encode).collect();
    assert_eq!(wire, expected);
}

#[tokio::test]
async fn link_frames_carry_the_event_for_their_media_kind() {
    let frames = frames_for_answer(&[
        "Listen to this clip: http://a/voice.mp3 and watch http://a/clip.mp4 after.",
    ]);
    let payloads: Vec<&str> = frames.iter().map(Frame::payload).collect();
    assert!(payloads.iter().any(|p| p.contains("\"audio_link\"")));
    assert!(payloads.iter().any(|p| p.contains("\"video_link\"")));
    for p in &payloads {
        let v: serde_json::Value = serde_json::from_str(p).unwrap();
        if v["event"] == "message" {
            let text = v["text"].as_str().unwrap();
            assert!(!text.contains("http"), "link leaked into prose: {text}");
        }
    }
}

#[tokio::test]
async fn session_rounds_and_replay_share_one_store() {
    let store = Arc::new(MemoryStore::new());
    let sessions = SessionStore::new(store.clone(), TTL, 2);
    let replay = ReplayCache::new(store, TTL, 10, TTL);

    sessions
        .save_conversation_id("t", "u", "conv-1")
        .await
        .unwrap();
    sessions.bump_round("t", "u").await.unwrap();
    sessions.bump_round("t", "u").await.unwrap();
    // Third round trips the cap of 2: context cleared, counter restarted.
    let rs = sessions.bump_round("t", "u").await.unwrap();
    assert!(rs.reset);
    assert_eq!(rs.round, 1);
    assert_eq!(sessions.conversation_id("t", "u").await.unwrap(), None);

    // Session teardown leaves sealed replay entries untouched.
    let mut w = replay.writer("sse:t:u:v:h").await;
    w.push(&Frame::message("hi there", None)).await;
    w.seal().await;
    sessions.clear("t", "u").await.unwrap();
    assert!(replay.load("sse:t:u:v:h").await.unwrap().is_some());
}
