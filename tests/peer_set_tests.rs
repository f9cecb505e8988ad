mod common;

use gossip_hashgraph::{
    peers::{Peer, PeerSet},
    utils::{super_majority, trust_count},
};

use common::{peer, peer_set, signers};

#[test]
fn test_super_majority_and_trust_count() {
    for (n, sm, trust) in [(1, 1, 0), (2, 2, 1), (3, 3, 1), (4, 3, 2), (7, 5, 3), (10, 7, 4)] {
        let set = peer_set(&signers(n));
        assert_eq!(set.super_majority(), sm, "n = {n}");
        assert_eq!(set.trust_count(), trust, "n = {n}");
        assert_eq!(super_majority(n), sm);
        assert_eq!(trust_count(n), trust);
    }
}

#[test]
fn test_lookups_by_key_and_id() {
    let signers = signers(3);
    let set = peer_set(&signers);
    let second = peer(&signers[1], 1);

    assert_eq!(set.len(), 3);
    assert!(set.contains(&second.pub_key));
    assert_eq!(set.by_pub_key(&second.pub_key), Some(&second));
    assert_eq!(set.by_id(second.id()), Some(&second));
    assert_eq!(set.ids().len(), 3);
    assert!(!set.contains(&[0; 20]));
}

#[test]
fn test_membership_changes_build_new_sets() {
    let signers = signers(4);
    let base = peer_set(&signers[..3]);
    let newcomer = peer(&signers[3], 3);

    let grown = base.with_new_peer(newcomer.clone());
    assert_eq!(base.len(), 3);
    assert_eq!(grown.len(), 4);
    assert_ne!(base.hash(), grown.hash());
    assert_eq!(grown, peer_set(&signers));

    let shrunk = grown.with_removed_peer(&newcomer.pub_key);
    assert_eq!(shrunk, base);
    assert_eq!(shrunk.hex(), base.hex());
}

#[test]
fn test_duplicate_keys_keep_first_entry() {
    let signers = signers(2);
    let first = peer(&signers[0], 0);
    let duplicate = Peer::new(first.pub_key.clone(), "inmem://elsewhere", "dup");
    let set = PeerSet::new(vec![first.clone(), peer(&signers[1], 1), duplicate]);

    assert_eq!(set.len(), 2);
    assert_eq!(set.by_pub_key(&first.pub_key).unwrap().net_addr, first.net_addr);
}

#[test]
fn test_peer_order_changes_identity() {
    let signers = signers(2);
    let forward = PeerSet::new(vec![peer(&signers[0], 0), peer(&signers[1], 1)]);
    let backward = PeerSet::new(vec![peer(&signers[1], 1), peer(&signers[0], 0)]);
    assert_ne!(forward.hash(), backward.hash());
}
