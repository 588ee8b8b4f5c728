//! Property checks for the negentropy codec and reconciliation engine.

use std::cmp::Ordering;
use std::collections::HashSet;

use nostr::{
    Bound, EventId, FRAME_SIZE_LIMIT_MINIMUM, Negentropy, NegentropyMessage, NegentropyStorage,
    Record, calculate_fingerprint, decode_varint, encode_varint,
};
use quickcheck::{Gen, QuickCheck, TestResult};
use sha2::{Digest, Sha256};

fn id(tag: u8, seed: u16) -> EventId {
    let mut hasher = Sha256::new();
    hasher.update([tag]);
    hasher.update(seed.to_le_bytes());
    let mut id = [0u8; 32];
    id.copy_from_slice(&hasher.finalize());
    id
}

fn to_records(tag: u8, entries: &[(u8, u16)]) -> Vec<Record> {
    entries
        .iter()
        .map(|&(ts, seed)| Record::new(1_000 + u64::from(ts), id(tag, seed)))
        .collect()
}

fn id_set(records: &[Record]) -> HashSet<EventId> {
    records.iter().map(|record| record.id).collect()
}

/// Drive both engines to completion, returning `(have, need, largest message)`.
fn reconcile(
    local: Vec<Record>,
    remote: Vec<Record>,
    frame_size_limit: u64,
) -> Option<(HashSet<EventId>, HashSet<EventId>, usize)> {
    let mut client = Negentropy::new(NegentropyStorage::new(local), frame_size_limit).ok()?;
    let mut relay = Negentropy::new(NegentropyStorage::new(remote), frame_size_limit).ok()?;

    let mut have = HashSet::new();
    let mut need = HashSet::new();
    let mut largest = 0;
    let mut msg = client.initiate().ok()?;

    for _ in 0..500 {
        largest = largest.max(msg.len());
        let reply = relay.reconcile(&msg).ok()?.next_message?;
        largest = largest.max(reply.len());

        let out = client.reconcile(&reply).ok()?;
        have.extend(out.have);
        need.extend(out.need);
        match out.next_message {
            Some(next) => msg = next,
            None => return Some((have, need, largest)),
        }
    }
    None
}

fn check_convergence(
    shared: Vec<(u8, u16)>,
    local_only: Vec<(u8, u16)>,
    remote_only: Vec<(u8, u16)>,
    frame_size_limit: u64,
) -> TestResult {
    let shared = to_records(0, &shared);
    let mut local = shared.clone();
    local.extend(to_records(1, &local_only));
    let mut remote = shared;
    remote.extend(to_records(2, &remote_only));

    let local_ids = id_set(&local);
    let remote_ids = id_set(&remote);
    let expected_have: HashSet<EventId> = local_ids.difference(&remote_ids).copied().collect();
    let expected_need: HashSet<EventId> = remote_ids.difference(&local_ids).copied().collect();

    match reconcile(local, remote, frame_size_limit) {
        Some((have, need, largest)) => {
            let within_limit = frame_size_limit == 0 || largest as u64 <= frame_size_limit;
            TestResult::from_bool(have == expected_have && need == expected_need && within_limit)
        }
        None => TestResult::failed(),
    }
}

#[test]
fn varint_roundtrips() {
    fn prop(value: u64) -> bool {
        let encoded = encode_varint(value);
        matches!(decode_varint(&encoded), Ok((v, n)) if v == value && n == encoded.len())
    }
    QuickCheck::new().quickcheck(prop as fn(u64) -> bool);
}

fn bound(timestamp: u8, prefix: &[u8]) -> Option<Bound> {
    let len = prefix.len().min(4);
    Bound::new(u64::from(timestamp % 4), prefix[..len].to_vec()).ok()
}

#[test]
fn bound_order_is_total() {
    fn prop(a: (u8, Vec<u8>), b: (u8, Vec<u8>), c: (u8, Vec<u8>)) -> TestResult {
        let (Some(a), Some(b), Some(c)) = (bound(a.0, &a.1), bound(b.0, &b.1), bound(c.0, &c.1))
        else {
            return TestResult::discard();
        };

        let reflexive = a.cmp(&a) == Ordering::Equal;
        let antisymmetric = a.cmp(&b) == b.cmp(&a).reverse()
            && (a.cmp(&b) != Ordering::Equal || a == b);
        let transitive = !(a <= b && b <= c) || a <= c;
        TestResult::from_bool(reflexive && antisymmetric && transitive)
    }
    QuickCheck::new()
        .tests(1000)
        .quickcheck(prop as fn((u8, Vec<u8>), (u8, Vec<u8>), (u8, Vec<u8>)) -> TestResult);
}

#[test]
fn shorter_prefix_sorts_first() {
    fn prop(timestamp: u64, prefix: Vec<u8>, extra: Vec<u8>) -> TestResult {
        let timestamp = timestamp % 1_000_000;
        let mut longer = prefix.clone();
        longer.extend_from_slice(&extra);
        if extra.is_empty() || longer.len() > 32 {
            return TestResult::discard();
        }
        match (Bound::new(timestamp, prefix), Bound::new(timestamp, longer)) {
            (Ok(short), Ok(long)) => TestResult::from_bool(short < long),
            _ => TestResult::failed(),
        }
    }
    QuickCheck::new().quickcheck(prop as fn(u64, Vec<u8>, Vec<u8>) -> TestResult);
}

#[test]
fn fingerprint_ignores_order() {
    fn prop(seeds: Vec<u16>) -> bool {
        let ids: Vec<EventId> = seeds.iter().map(|&seed| id(9, seed)).collect();
        let mut reversed = ids.clone();
        reversed.reverse();
        calculate_fingerprint(&ids) == calculate_fingerprint(&reversed)
    }
    QuickCheck::new().quickcheck(prop as fn(Vec<u16>) -> bool);
}

#[test]
fn decoding_arbitrary_bytes_never_panics() {
    fn prop(bytes: Vec<u8>) -> bool {
        let _ = NegentropyMessage::decode(&bytes);
        let mut prefixed = vec![0x61];
        prefixed.extend_from_slice(&bytes);
        let _ = NegentropyMessage::decode(&prefixed);

        if let Ok(mut relay) = Negentropy::new(NegentropyStorage::default(), 0) {
            let _ = relay.reconcile(&prefixed);
        }
        true
    }
    QuickCheck::new()
        .tests(500)
        .quickcheck(prop as fn(Vec<u8>) -> bool);
}

#[test]
fn reconciliation_finds_exact_difference() {
    fn prop(
        shared: Vec<(u8, u16)>,
        local_only: Vec<(u8, u16)>,
        remote_only: Vec<(u8, u16)>,
    ) -> TestResult {
        check_convergence(shared, local_only, remote_only, 0)
    }
    QuickCheck::new()
        .r#gen(Gen::new(400))
        .tests(60)
        .quickcheck(prop as fn(Vec<(u8, u16)>, Vec<(u8, u16)>, Vec<(u8, u16)>) -> TestResult);
}

#[test]
fn reconciliation_under_minimum_frame_limit() {
    fn prop(
        shared: Vec<(u8, u16)>,
        local_only: Vec<(u8, u16)>,
        remote_only: Vec<(u8, u16)>,
    ) -> TestResult {
        check_convergence(shared, local_only, remote_only, FRAME_SIZE_LIMIT_MINIMUM)
    }
    QuickCheck::new()
        .r#gen(Gen::new(600))
        .tests(30)
        .quickcheck(prop as fn(Vec<(u8, u16)>, Vec<(u8, u16)>, Vec<(u8, u16)>) -> TestResult);
}
