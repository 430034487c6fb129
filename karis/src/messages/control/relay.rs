use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;

/// Identifier of a relay channel on the board, numbered from 1.
pub type RelayId = u8;

/// Target state for a single relay.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayCommand {
    /// Relay channel, 1 based as printed on the board.
    pub id: RelayId,
    /// If true the relay is closed (on).
    pub state: bool,
    /// The firmware turns an ON relay back off after this many
    /// milliseconds. Ignored by the firmware for OFF commands.
    pub duration: Option<u64>,
}

/// Control message published on the control topic.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelayControlMessage {
    /// Device api key, the firmware drops commands without a matching key.
    pub api_key: String,
    /// One entry per relay to change.
    pub relays: Vec<RelayCommand>,
}

impl RelayControlMessage {
    /// Build a control message with a random target state for every relay.
    ///
    /// * `api_key`: device api key.
    /// * `relay_ids`: relays to include, in order.
    /// * `on_duration_ms`: optional duration attached to ON commands.
    /// * `rng`: random source, seeded in tests.
    pub fn randomised<R: Rng + ?Sized>(
        api_key: &str,
        relay_ids: &[RelayId],
        on_duration_ms: Option<u64>,
        rng: &mut R,
    ) -> Self {
        let relays = relay_ids
            .iter()
            .map(|id| {
                let state = rng.gen_bool(0.5);
                RelayCommand {
                    id: *id,
                    state,
                    duration: if state { on_duration_ms } else { None },
                }
            })
            .collect();
        Self {
            api_key: api_key.to_owned(),
            relays,
        }
    }

    /// Expected state of every relay in the message.
    pub fn target_states(&self) -> BTreeMap<RelayId, bool> {
        self.relays.iter().map(|r| (r.id, r.state)).collect()
    }

    /// Short human readable summary such as `{1: true, 2: false}`.
    pub fn summary(&self) -> String {
        let entries: Vec<String> = self
            .target_states()
            .iter()
            .map(|(id, state)| format!("{id}: {state}"))
            .collect();
        format!("{{{}}}", entries.join(", "))
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use rstest::rstest;

    #[rstest]
    #[case(
        r#"{"api_key": "abc",
        "relays": [{"id": 1, "state": true}, {"id": 2, "state": false}]}"#
    )]
    #[case(
        r#"{"api_key": "abc",
        "relays": [{"id": 6, "state": true, "duration": 30000}]}"#
    )]
    #[case(r#"{"api_key": "abc", "relays": []}"#)]
    fn test_parse_control_message(#[case] raw_string: &str) {
        let _parsed: RelayControlMessage = serde_json::from_str(raw_string).unwrap();
    }

    #[test]
    fn test_duration_omitted_when_unset() {
        let message = RelayControlMessage {
            api_key: String::from("abc"),
            relays: vec![
                RelayCommand {
                    id: 1,
                    state: true,
                    duration: None,
                },
                RelayCommand {
                    id: 2,
                    state: true,
                    duration: Some(500),
                },
            ],
        };
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(
            json,
            r#"{"api_key":"abc","relays":[{"id":1,"state":true},{"id":2,"state":true,"duration":500}]}"#
        );
    }

    #[rstest]
    #[case(vec![1, 2, 3, 4, 5, 6], 1)]
    #[case(vec![1, 2, 3], 42)]
    #[case(vec![], 7)]
    fn test_randomised_covers_every_relay(#[case] relay_ids: Vec<RelayId>, #[case] seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let message = RelayControlMessage::randomised("abc", &relay_ids, None, &mut rng);

        let ids: Vec<RelayId> = message.relays.iter().map(|r| r.id).collect();
        assert_eq!(ids, relay_ids, "Every relay should be commanded once, in order");
        assert_eq!(message.target_states().len(), relay_ids.len());
    }

    #[test]
    fn test_duration_only_attached_to_on_commands() {
        let mut rng = StdRng::seed_from_u64(3);
        let message =
            RelayControlMessage::randomised("abc", &[1, 2, 3, 4, 5, 6], Some(1000), &mut rng);
        for relay in message.relays {
            assert_eq!(relay.duration.is_some(), relay.state);
        }
    }

    #[test]
    fn test_summary() {
        let message = RelayControlMessage {
            api_key: String::from("abc"),
            relays: vec![
                RelayCommand {
                    id: 2,
                    state: false,
                    duration: None,
                },
                RelayCommand {
                    id: 1,
                    state: true,
                    duration: None,
                },
            ],
        };
        assert_eq!(message.summary(), "{1: true, 2: false}");
    }
}
