// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![allow(missing_docs, reason = "test code")]

//! Tests of namespaces through the public API.

use std::sync::Arc;

use membuffer::{
    BytesCodec, CodecError, Error, FnCodec, KeyLength, Locking, Membuffer, MembufferConfig, StoreOutcome, WritePolicy,
};
use rstest::rstest;

fn text_codec() -> impl membuffer::Codec<Item = String> {
    FnCodec::new(
        |item: &String, out: &mut Vec<u8>| {
            if item.is_empty() {
                return Err("empty strings are not cached".into());
            }
            out.extend_from_slice(item.as_bytes());
            Ok(())
        },
        |bytes: &[u8]| Ok(String::from_utf8(bytes.to_vec())?),
    )
}

fn config(locking: Locking, write_policy: WritePolicy, segment_count: usize) -> MembufferConfig {
    MembufferConfig {
        total_size: 1 << 20,
        segment_count,
        locking,
        write_policy,
        seed: Some(11),
        ..MembufferConfig::default()
    }
}

#[rstest]
#[case(Locking::ReadWrite, WritePolicy::Blocking, 1)]
#[case(Locking::ReadWrite, WritePolicy::NonBlockingPreferred, 4)]
#[case(Locking::Exclusive, WritePolicy::Blocking, 2)]
#[case(Locking::Exclusive, WritePolicy::NonBlockingPreferred, 8)]
fn get_set_work_under_every_lock_mode(
    #[case] locking: Locking,
    #[case] write_policy: WritePolicy,
    #[case] segment_count: usize,
) {
    let cache = Arc::new(Membuffer::new(&config(locking, write_policy, segment_count)).expect("valid config"));
    assert_eq!(cache.segment_count(), segment_count);

    let ns = cache.namespace("modes").build(text_codec());
    for index in 0..100 {
        ns.set(format!("k{index}").as_bytes(), &format!("value {index}"))
            .expect("serializable");
    }
    for index in 0..100 {
        assert_eq!(
            ns.get(format!("k{index}").as_bytes()).expect("decodable"),
            Some(format!("value {index}"))
        );
    }
}

#[test]
fn namespaces_with_equal_keys_do_not_collide() {
    let cache = Arc::new(Membuffer::builder().total_size(1 << 20).build().expect("valid config"));
    let left = cache.namespace("left").build(text_codec());
    let right = cache.namespace("right").build(text_codec());

    left.set(b"shared", &"from left".to_owned()).expect("serializable");
    assert!(!right.has_key(b"shared"));

    right.set(b"shared", &"from right".to_owned()).expect("serializable");
    assert_eq!(left.get(b"shared").expect("decodable").as_deref(), Some("from left"));
    assert_eq!(right.get(b"shared").expect("decodable").as_deref(), Some("from right"));
}

#[test]
fn namespaces_with_the_same_prefix_share_entries() {
    let cache = Arc::new(Membuffer::builder().total_size(1 << 20).build().expect("valid config"));
    let writer = cache.namespace("same").build(BytesCodec);
    let reader = cache.namespace("same").build(BytesCodec);

    writer.set(b"key", &b"payload".to_vec()).expect("serializable");
    assert_eq!(reader.get(b"key").expect("decodable"), Some(b"payload".to_vec()));
}

#[test]
fn serialize_failure_drops_the_old_value() {
    let cache = Arc::new(Membuffer::builder().total_size(1 << 20).build().expect("valid config"));
    let ns = cache.namespace("texts").build(text_codec());

    ns.set(b"k", &"old".to_owned()).expect("serializable");
    let err = ns.set(b"k", &String::new()).expect_err("empty strings fail to serialize");
    assert!(matches!(err, Error::Codec(_)));
    assert_eq!(ns.get(b"k").expect("decodable"), None);
    assert_eq!(ns.info().failures, 1);
}

#[test]
fn deserialize_failure_is_reported() {
    let cache = Arc::new(Membuffer::builder().total_size(1 << 20).build().expect("valid config"));
    let raw = cache.namespace("texts").build(BytesCodec);
    let texts = cache.namespace("texts").build(text_codec());

    raw.set(b"k", &vec![0xff, 0xfe]).expect("serializable");
    let err = texts.get(b"k").expect_err("invalid utf-8");
    assert!(matches!(err, Error::Codec(_)));
    assert_eq!(texts.info().failures, 1);
}

#[test]
fn fixed_length_keys_of_other_lengths_never_hit() {
    let cache = Arc::new(Membuffer::builder().total_size(1 << 20).build().expect("valid config"));
    let ns = cache
        .namespace("fixed")
        .key_length(KeyLength::Fixed(4))
        .build(BytesCodec);

    ns.set(b"ab\0d", &b"v".to_vec()).expect("serializable");
    assert_eq!(ns.get(b"ab\0d").expect("decodable"), Some(b"v".to_vec()));
    assert_eq!(ns.get(b"ab").expect("decodable"), None);

    ns.set(b"abcdXYZ", &b"long".to_vec()).expect("serializable");
    assert!(!ns.has_key(b"abcdXYZ"));
    assert!(!ns.has_key(b"abcd"));
}

#[test]
fn partial_access_reads_and_rewrites_in_place() {
    let cache = Arc::new(Membuffer::builder().total_size(1 << 20).build().expect("valid config"));
    let ns = cache.namespace("counters").build(BytesCodec);
    ns.set(b"counter", &0_u64.to_le_bytes().to_vec()).expect("serializable");

    for _ in 0..10 {
        let modified = ns
            .set_partial(b"counter", |payload| {
                let bytes: [u8; 8] = payload.as_slice().try_into()?;
                payload
                    .as_mut_slice()
                    .copy_from_slice(&(u64::from_le_bytes(bytes) + 1).to_le_bytes());
                Ok(())
            })
            .expect("mutator succeeds");
        assert!(modified);
    }

    let value = ns
        .get_partial(b"counter", |bytes| Ok(u64::from_le_bytes(bytes.try_into()?)))
        .expect("extractor succeeds");
    assert_eq!(value, Some(10));

    assert!(!ns.set_partial(b"absent", |_| Ok(())).expect("misses are not errors"));
    assert_eq!(ns.get_partial(b"absent", |bytes| Ok(bytes.len())).expect("miss"), None);
}

#[test]
fn failing_mutator_drops_the_item() {
    let cache = Arc::new(Membuffer::builder().total_size(1 << 20).build().expect("valid config"));
    let ns = cache.namespace("mutations").build(BytesCodec);
    ns.set(b"k", &b"value".to_vec()).expect("serializable");

    let err = ns
        .set_partial(b"k", |_| Err(CodecError::from("refused")))
        .expect_err("mutator fails");
    assert!(matches!(err, Error::Mutate(_)));
    assert!(!ns.has_key(b"k"));
    assert_eq!(ns.info().failures, 1);
}

#[test]
fn info_counts_operations() {
    let cache = Arc::new(Membuffer::builder().total_size(1 << 20).build().expect("valid config"));
    let ns = cache.namespace("counted").build(BytesCodec);

    ns.set(b"a", &b"1".to_vec()).expect("serializable");
    ns.set(b"huge", &vec![0; cache.max_item_size() + 1]).expect("rejection is not an error");
    let _ = ns.get(b"a").expect("decodable");
    let _ = ns.get(b"missing").expect("decodable");

    let info = ns.info();
    assert_eq!(info.sets, 2);
    assert_eq!(info.gets, 2);
    assert_eq!(info.hits, 1);
    assert_eq!(info.failures, 1);
    assert_eq!(info.membuffer.totals.used_entries, 1);

    let report = info.to_string();
    assert!(report.contains("2 gets (50.0% hit rate)"), "{report}");
    assert!(report.contains("1 segments"), "{report}");
}

#[test]
fn unsynchronized_namespaces_share_the_cache_across_threads() {
    let cache = Arc::new(
        Membuffer::builder()
            .total_size(1 << 20)
            .segment_count(4)
            .thread_safe(false)
            .build()
            .expect("valid config"),
    );

    std::thread::scope(|scope| {
        for thread in 0..4_u8 {
            let cache = Arc::clone(&cache);
            scope.spawn(move || {
                let ns = cache.namespace([thread]).build(BytesCodec);
                for index in 0..500_u32 {
                    ns.set(&index.to_le_bytes(), &vec![thread; 64]).expect("serializable");
                    if let Some(found) = ns.get(&index.to_le_bytes()).expect("decodable") {
                        assert_eq!(found, vec![thread; 64]);
                    }
                }
            });
        }
    });

    assert!(cache.stats().totals.used_entries > 0);
}

#[test]
fn validated_cache_behaves_like_a_plain_one() {
    let cache = Arc::new(
        Membuffer::builder()
            .total_size(1 << 20)
            .build_validated()
            .expect("valid config"),
    );
    let ns = cache.namespace("checked").build(text_codec());

    ns.set(b"k", &"checked value".to_owned()).expect("serializable");
    assert_eq!(ns.get(b"k").expect("decodable").as_deref(), Some("checked value"));
    assert!(ns.is_cacheable(cache.max_item_size()));
    assert!(!ns.is_cacheable(cache.max_item_size() + 1));
}

#[test]
fn fingerprint_level_api_round_trips() {
    let cache = Membuffer::builder().total_size(1 << 20).build().expect("valid config");
    let fingerprint = membuffer::Fingerprint::of(b"raw");

    assert_eq!(cache.store(fingerprint, b"bytes"), StoreOutcome::Stored);
    assert!(cache.contains(fingerprint));
    assert_eq!(cache.lookup(fingerprint).as_deref(), Some(&b"bytes"[..]));

    assert!(cache.remove(fingerprint));
    assert!(!cache.contains(fingerprint));

    cache.store(fingerprint, b"again");
    cache.clear();
    assert_eq!(cache.stats().totals.used_entries, 0);
}

#[cfg(feature = "serde")]
mod serde_support {
    use std::sync::Arc;

    use membuffer::{BincodeCodec, Membuffer, MembufferConfig};

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct DirEntry {
        name: String,
        revision: u64,
        children: Vec<String>,
    }

    #[test]
    fn bincode_items_round_trip() {
        let cache = Arc::new(Membuffer::builder().total_size(1 << 20).build().expect("valid config"));
        let ns = cache.namespace("dirs").build(BincodeCodec::<DirEntry>::new());

        let entry = DirEntry {
            name: "trunk".to_owned(),
            revision: 42,
            children: vec!["src".to_owned(), "docs".to_owned()],
        };
        ns.set(b"/trunk@42", &entry).expect("serializable");
        assert_eq!(ns.get(b"/trunk@42").expect("decodable"), Some(entry));
    }

    #[test]
    fn config_survives_bincode() {
        let bytes = bincode::serialize(&MembufferConfig::default()).expect("serializable");
        let config: MembufferConfig = bincode::deserialize(&bytes).expect("deserializable");
        assert_eq!(config, MembufferConfig::default());
    }
}
