//! Block and metadata lifetime accounting across a full session.
//!
//! Kept in its own binary so the process-wide live counters are not
//! disturbed by unrelated tests running in parallel.

mod common;

use std::sync::Arc;

use aircast::buffer::{MetaUpdate, live_blocks, live_updates};
use aircast::config::MountConfig;
use aircast::format::ingest::MountIngest;
use aircast::format::sender::{Framing, ListenerSender};
use aircast::stats::Stats;
use common::{ChunkReader, RecordingChannel, icy_interleave, inline_block};

#[test]
fn buffer_counts_return_to_baseline_after_teardown() {
    let updates_before = live_updates();
    let blocks_before = live_blocks();

    {
        // a source session with a metadata update and two listeners
        let meta = inline_block("StreamTitle='leakcheck';");
        let stream = icy_interleave(&[0x41; 64], 16, 16, &meta);

        let mut ingest =
            MountIngest::new("/leak", "application/ogg", 16, Arc::new(Stats::new()));
        ingest.apply_settings(&MountConfig {
            queue_block_size: 16,
            ..MountConfig::default()
        });
        let mut reader = ChunkReader::new([stream]);

        let mut blocks = Vec::new();
        for _ in 0..40 {
            if let Some(block) = ingest.next_block(&mut reader).unwrap() {
                blocks.push(block);
            }
        }
        assert!(live_blocks() > blocks_before);
        assert!(live_updates() > updates_before);

        let mut icy_listener = ListenerSender::new(Framing::Icy, 16);
        let mut raw_listener = ListenerSender::new(Framing::Raw, 0);
        let mut chan = RecordingChannel::new(9);
        for block in &blocks {
            for _ in 0..10_000 {
                if icy_listener.write_block(block, &mut chan).unwrap().done {
                    break;
                }
            }
            for _ in 0..10_000 {
                if raw_listener.write_block(block, &mut chan).unwrap().done {
                    break;
                }
            }
        }
        // listeners hold their own metadata references while alive
        assert!(icy_listener.associated().is_some());
    }

    // everything released: counts are back where they started
    assert_eq!(live_blocks(), blocks_before);
    assert_eq!(live_updates(), updates_before);

    // the blank singleton survives any number of release cycles
    let blank = MetaUpdate::blank();
    assert_eq!(blank.generation(), 0);
    drop(blank);
    assert_eq!(MetaUpdate::blank().generation(), 0);
    assert_eq!(live_updates(), updates_before);
}
