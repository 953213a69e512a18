use proptest::prelude::*;

use crate::config::SpinPolicy;
use crate::endpoint::Endpoint;
use crate::error::{Error, Phase};
use crate::state::{Role, INITIATOR_ACTIVE, RESPONDER_ACTIVE};

#[derive(Debug, Clone, Copy)]
enum Op {
    SwitchToPeer(Role),
    /// Only issued for the side that holds control, so it never blocks.
    SwitchFromPeer,
    Write(u8),
}

fn role() -> impl Strategy<Value = Role> {
    prop_oneof![Just(Role::Initiator), Just(Role::Responder)]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        role().prop_map(Op::SwitchToPeer),
        Just(Op::SwitchFromPeer),
        (1u8..=32).prop_map(Op::Write),
    ]
}

proptest! {
    #[test]
    fn at_most_one_side_is_ever_active(ops in prop::collection::vec(op(), 0..64)) {
        let (a, b) = Endpoint::pair(32, SpinPolicy::disabled()).unwrap();
        let mut holder = Role::Initiator;

        for op in ops {
            let (active, inactive) = match holder {
                Role::Initiator => (&a, &b),
                Role::Responder => (&b, &a),
            };

            match op {
                Op::SwitchToPeer(who) if who == holder => {
                    active.switch_to_peer().unwrap();
                    holder = holder.peer();
                }
                Op::SwitchToPeer(_) => {
                    let err = inactive.switch_to_peer().unwrap_err();
                    let is_before_wake = matches!(
                        err,
                        Error::UnexpectedState { phase: Phase::BeforeWake, .. }
                    );
                    prop_assert!(is_before_wake);
                }
                Op::SwitchFromPeer => active.switch_from_peer().unwrap(),
                Op::Write(n) => {
                    let payload = vec![n; n as usize];
                    prop_assert_eq!(active.write_data(&payload).unwrap(), n as u32);
                    prop_assert!(inactive.write_data(&payload).is_err());
                }
            }

            prop_assert!(a.is_active() != b.is_active());
            let expected = match holder {
                Role::Initiator => INITIATOR_ACTIVE,
                Role::Responder => RESPONDER_ACTIVE,
            };
            prop_assert_eq!(a.conn_state(), expected);
        }
    }

    #[test]
    fn even_number_of_handoffs_restores_initial_state(rounds in 0usize..32) {
        let (a, b) = Endpoint::pair(0, SpinPolicy::disabled()).unwrap();
        for _ in 0..rounds {
            a.switch_to_peer().unwrap();
            b.switch_from_peer().unwrap();
            b.switch_to_peer().unwrap();
            a.switch_from_peer().unwrap();
        }
        prop_assert_eq!(a.conn_state(), INITIATOR_ACTIVE);
        prop_assert!(a.is_active());
    }
}
