//! Property tests: replicas converge whatever the delivery order.

use collab_server::document::{DocumentError, RoomDocument};
use proptest::prelude::*;

const PEERS: usize = 3;

/// One local edit by `peer`. With `catch_up` the peer first merges every
/// update produced so far, so later edits causally depend on earlier ones.
#[derive(Debug, Clone)]
struct Edit {
    peer: usize,
    index: u32,
    text: String,
    catch_up: bool,
}

fn arb_edit() -> impl Strategy<Value = Edit> {
    (0..PEERS, 0u32..32, "[a-z]{1,4}", any::<bool>()).prop_map(|(peer, index, text, catch_up)| Edit {
        peer,
        index,
        text,
        catch_up,
    })
}

/// Run the edits on their peers and collect the updates they produce.
fn produce(edits: &[Edit]) -> (Vec<RoomDocument>, Vec<Vec<u8>>) {
    let peers: Vec<RoomDocument> = (0..PEERS).map(|_| RoomDocument::new()).collect();
    let mut updates: Vec<Vec<u8>> = Vec::new();
    for edit in edits {
        let doc = &peers[edit.peer];
        if edit.catch_up {
            for update in &updates {
                doc.apply_update(update).unwrap();
            }
        }
        updates.push(doc.insert_text(edit.index, &edit.text));
    }
    (peers, updates)
}

fn arb_scenario() -> impl Strategy<Value = (Vec<Edit>, Vec<usize>, Vec<usize>)> {
    prop::collection::vec(arb_edit(), 1..24).prop_flat_map(|edits| {
        let order: Vec<usize> = (0..edits.len()).collect();
        (
            Just(edits),
            Just(order.clone()).prop_shuffle(),
            Just(order).prop_shuffle(),
        )
    })
}

proptest! {
    /// Two replicas that see every update, in different orders, end equal
    /// and contain every inserted character.
    #[test]
    fn prop_any_delivery_order_converges((edits, order_a, order_b) in arb_scenario()) {
        let (_peers, updates) = produce(&edits);

        let a = RoomDocument::new();
        let b = RoomDocument::new();
        for i in &order_a {
            a.apply_update(&updates[*i]).unwrap();
        }
        for i in &order_b {
            b.apply_update(&updates[*i]).unwrap();
        }

        prop_assert_eq!(a.content(), b.content());
        let expected: usize = edits.iter().map(|e| e.text.len()).sum();
        prop_assert_eq!(a.content().len(), expected);
    }

    /// Applying an update twice changes nothing.
    #[test]
    fn prop_apply_is_idempotent((edits, order, _) in arb_scenario()) {
        let (_peers, updates) = produce(&edits);

        let once = RoomDocument::new();
        let twice = RoomDocument::new();
        for i in &order {
            once.apply_update(&updates[*i]).unwrap();
            twice.apply_update(&updates[*i]).unwrap();
            twice.apply_update(&updates[*i]).unwrap();
        }
        prop_assert_eq!(once.content(), twice.content());
    }

    /// The originating peers, once they exchange state vectors and diffs,
    /// reach the same content as a replica fed every update.
    #[test]
    fn prop_state_exchange_converges((edits, order, _) in arb_scenario()) {
        let (peers, updates) = produce(&edits);

        let hub = RoomDocument::new();
        for i in &order {
            hub.apply_update(&updates[*i]).unwrap();
        }
        for peer in &peers {
            let to_hub = peer.encode_diff(&hub.encode_state_vector()).unwrap();
            hub.apply_update(&to_hub).unwrap();
        }
        for peer in &peers {
            let to_peer = hub.encode_diff(&peer.encode_state_vector()).unwrap();
            peer.apply_update(&to_peer).unwrap();
            prop_assert_eq!(peer.content(), hub.content());
        }
    }

    /// A real update with random bytes overwritten never takes the process
    /// down, and a malformed one leaves the replica as it was.
    #[test]
    fn prop_mutated_update_never_aborts(
        (edits, _, _) in arb_scenario(),
        mutations in prop::collection::vec((any::<prop::sample::Index>(), any::<u8>()), 1..4),
    ) {
        let (_peers, updates) = produce(&edits);
        let mut update = updates[0].clone();
        for (at, byte) in &mutations {
            let i = at.index(update.len());
            update[i] = *byte;
        }

        let doc = RoomDocument::new();
        doc.insert_text(0, "base");
        if let Err(DocumentError::MalformedUpdate(_)) = doc.apply_update(&update) {
            prop_assert_eq!(doc.content(), "base");
            prop_assert_eq!(doc.version(), 1);
        }
    }
}
