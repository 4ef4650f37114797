use std::collections::HashMap;
use std::net::Ipv4Addr;

use proptest::prelude::*;
use trdp_stack::mux::{IgmpAction, MembershipMap};

#[derive(Debug, Clone)]
enum Op {
    Join(u8, u8),
    Leave(u8, u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4, 0u8..2).prop_map(|(g, i)| Op::Join(g, i)),
        (0u8..4, 0u8..2).prop_map(|(g, i)| Op::Leave(g, i)),
    ]
}

fn group(g: u8) -> Ipv4Addr {
    Ipv4Addr::new(239, 0, 1, g)
}

fn iface(i: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, i + 1)
}

proptest! {
    /// After any interleaving of joins and leaves, the outstanding OS
    /// memberships equal the pairs with a positive live count, and OS
    /// actions fire exactly on the 0→1 and 1→0 edges.
    #[test]
    fn refcount_matches_model(ops in prop::collection::vec(op_strategy(), 0..200)) {
        let mut map = MembershipMap::new();
        let mut model: HashMap<(Ipv4Addr, Ipv4Addr), u32> = HashMap::new();
        let mut os_joined: std::collections::HashSet<(Ipv4Addr, Ipv4Addr)> =
            std::collections::HashSet::new();

        for op in ops {
            match op {
                Op::Join(g, i) => {
                    let key = (group(g), iface(i));
                    let action = map.join(key.0, key.1);
                    let count = model.entry(key).or_insert(0);
                    *count += 1;
                    if *count == 1 {
                        prop_assert_eq!(action, Some(IgmpAction::Join));
                        os_joined.insert(key);
                    } else {
                        prop_assert_eq!(action, None);
                    }
                }
                Op::Leave(g, i) => {
                    let key = (group(g), iface(i));
                    let action = map.leave(key.0, key.1);
                    match model.get_mut(&key) {
                        Some(count) if *count > 0 => {
                            *count -= 1;
                            if *count == 0 {
                                prop_assert_eq!(action, Some(IgmpAction::Leave));
                                os_joined.remove(&key);
                                model.remove(&key);
                            } else {
                                prop_assert_eq!(action, None);
                            }
                        }
                        // Unbalanced leave: bookkeeping must not go
                        // negative or emit an OS action.
                        _ => prop_assert_eq!(action, None),
                    }
                }
            }
            prop_assert_eq!(map.outstanding(), os_joined.len());
            for (key, count) in &model {
                prop_assert_eq!(map.count(key.0, key.1), *count);
            }
        }

        // Close-time drain releases exactly the outstanding set.
        let drained = map.drain();
        prop_assert_eq!(drained.len(), os_joined.len());
        prop_assert_eq!(map.outstanding(), 0);
    }
}
