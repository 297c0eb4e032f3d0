//! Property-based tests for WISP
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Window Properties
// ============================================================================

mod window_properties {
    use super::*;
    use std::time::Duration;
    use wisp_core::{SendWindow, TransferConfig, next_pipeline_size};

    #[derive(Debug, Clone)]
    enum Signal {
        Ack(u64),
        Timeout,
    }

    fn signal() -> impl Strategy<Value = Signal> {
        prop_oneof![
            4 => (0u64..20_000).prop_map(Signal::Ack),
            1 => Just(Signal::Timeout),
        ]
    }

    proptest! {
        /// The next window size never leaves the configured bounds
        #[test]
        fn pipeline_size_bounded(current in 0usize..10_000, rtt_ms in 0u64..60_000) {
            let config = TransferConfig::default();
            let next = next_pipeline_size(current, Duration::from_millis(rtt_ms), &config);
            prop_assert!(next >= config.min_pipeline);
            prop_assert!(next <= config.max_pipeline);
        }

        /// Any mix of acks and timeouts keeps the window within bounds
        #[test]
        fn window_stays_bounded(signals in prop::collection::vec(signal(), 1..300)) {
            let config = TransferConfig::default();
            let window = SendWindow::new(&config);
            for s in signals {
                let snap = match s {
                    Signal::Ack(ms) => window.on_ack(Duration::from_millis(ms)),
                    Signal::Timeout => window.on_timeout(),
                };
                prop_assert!(snap.pipeline_size >= config.min_pipeline);
                prop_assert!(snap.pipeline_size <= config.max_pipeline);
            }
        }

        /// A timeout leaves the smoothed RTT at exactly the penalty value
        #[test]
        fn timeout_forces_penalty(acks in prop::collection::vec(0u64..5_000, 0..50)) {
            let config = TransferConfig::default();
            let window = SendWindow::new(&config);
            for ms in acks {
                window.on_ack(Duration::from_millis(ms));
            }
            let snap = window.on_timeout();
            prop_assert_eq!(snap.avg_rtt, config.timeout_penalty_rtt);
        }
    }
}

// ============================================================================
// Chunk Arithmetic Properties
// ============================================================================

mod chunk_properties {
    use super::*;
    use wisp_files::FileChunker;

    proptest! {
        /// Chunk ranges tile the file exactly, in order, without overlap
        #[test]
        fn ranges_tile_file(size in 0u64..5_000_000, chunk_size in 1usize..1_000_000) {
            let chunker = FileChunker::with_chunk_size(chunk_size);
            let count = chunker.chunk_count(size);

            let mut next = 0u64;
            for index in 0..count {
                let range = chunker.chunk_range(index, size).unwrap();
                prop_assert_eq!(range.start, next);
                prop_assert!(range.end > range.start);
                prop_assert!(range.end - range.start <= chunk_size as u64);
                prop_assert_eq!(chunker.is_last_chunk(index, size), index + 1 == count);
                next = range.end;
            }
            prop_assert_eq!(next, size);
            prop_assert!(chunker.chunk_range(count, size).is_none());
        }

        /// Both sides derive the same count from the declared size
        #[test]
        fn chunk_count_is_ceiling(size in 0u64..u64::MAX / 2, chunk_size in 1usize..10_000_000) {
            let count = FileChunker::with_chunk_size(chunk_size).chunk_count(size);
            let c = chunk_size as u64;
            prop_assert!(count * c >= size);
            prop_assert!(count == 0 || (count - 1) * c < size);
        }
    }
}

// ============================================================================
// Codec Properties
// ============================================================================

mod codec_properties {
    use super::*;
    use bytes::Bytes;
    use wisp_core::Message;
    use wisp_files::FileId;

    fn file_id() -> impl Strategy<Value = FileId> {
        "file_[0-9]{13}_[0-9a-z]{9}".prop_map(|id| FileId::new(id))
    }

    fn message() -> impl Strategy<Value = Message> {
        prop_oneof![
            (file_id(), ".{0,40}", any::<u64>(), "[a-z]+/[a-z0-9.+-]+").prop_map(
                |(file_id, name, size, file_type)| Message::FileOffer {
                    file_id,
                    name,
                    size,
                    file_type,
                }
            ),
            file_id().prop_map(|file_id| Message::FileAccepted { file_id }),
            (file_id(), proptest::option::of(".{0,60}"))
                .prop_map(|(file_id, reason)| Message::FileRejected { file_id, reason }),
            (file_id(), any::<u64>()).prop_map(|(file_id, chunks_to_expect)| {
                Message::FileCatchup {
                    file_id,
                    chunks_to_expect,
                }
            }),
            (
                file_id(),
                any::<u64>(),
                prop::collection::vec(any::<u8>(), 0..2048),
                any::<bool>()
            )
                .prop_map(|(file_id, index, data, is_last_chunk)| Message::FileChunk {
                    file_id,
                    index,
                    data: Bytes::from(data),
                    is_last_chunk,
                }),
            (file_id(), any::<u64>()).prop_map(|(file_id, index)| Message::FileAck { file_id, index }),
            file_id().prop_map(|file_id| Message::FileComplete { file_id }),
        ]
    }

    proptest! {
        /// Every message survives the wire unchanged
        #[test]
        fn message_roundtrip(message in message()) {
            let encoded = message.encode().unwrap();
            let decoded = Message::decode(&encoded).unwrap();
            prop_assert_eq!(decoded, message);
        }

        /// Arbitrary bytes never panic the decoder
        #[test]
        fn decode_garbage_does_not_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = Message::decode(&bytes);
        }
    }
}

// ============================================================================
// Chunk Store Properties
// ============================================================================

mod store_properties {
    use super::*;
    use bytes::Bytes;
    use std::sync::Arc;
    use wisp_files::{ChunkBackend, ChunkStore, FileId, MemoryBackend, StoreEvent, StoreOptions};

    const CHUNK: usize = 64;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Writing chunks repeatedly and in any order stores each index once
        /// and assembles the original bytes
        #[test]
        fn store_is_idempotent(
            chunks in 1usize..30,
            order in prop::collection::vec(any::<prop::sample::Index>(), 1..120),
            batch_size in 1usize..12,
        ) {
            let data: Vec<u8> = (0..chunks * CHUNK).map(|i| (i * 7 % 256) as u8).collect();
            let data = Bytes::from(data);

            // Every index at least once, then arbitrary repeats
            let mut writes: Vec<usize> = (0..chunks).collect();
            writes.extend(order.iter().map(|i| i.index(chunks)));

            let assembled = runtime().block_on(async {
                let backend = Arc::new(MemoryBackend::new());
                let (store, mut events) = ChunkStore::spawn(
                    Arc::clone(&backend) as Arc<dyn ChunkBackend>,
                    StoreOptions { batch_size, workers: 2 },
                );
                let file_id = FileId::new("file_prop");
                for &index in writes.iter().rev() {
                    let start = index * CHUNK;
                    store
                        .enqueue(file_id.clone(), index as u64, data.slice(start..start + CHUNK))
                        .unwrap();
                }

                let mut confirmed = std::collections::HashSet::new();
                while confirmed.len() < chunks {
                    match events.recv().await.unwrap() {
                        StoreEvent::Stored { index, .. } => {
                            confirmed.insert(index);
                        }
                        StoreEvent::BatchFailed { error, .. } => panic!("batch failed: {error}"),
                    }
                }
                assert_eq!(backend.chunk_count(&file_id), chunks);
                store
                    .read_file(&file_id, data.len() as u64, chunks as u64)
                    .await
                    .unwrap()
            });

            prop_assert_eq!(assembled.data, data);
            prop_assert!(assembled.missing.is_empty());
        }
    }
}
