//! Pairwise room derivation for mesh calls.
//!
//! Every pair of participants shares one signaling room. Both ends derive
//! the room name on their own from the base call id and the two slot
//! numbers, so no coordination round-trip is needed before joining.

use std::fmt;

use crate::error::SetupError;

/// Identifier of one pairwise signaling room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The room this participant shares with one other slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRoom {
    pub peer_slot: u32,
    pub room_id: RoomId,
}

/// Largest group size for which concatenated slot pairs stay unambiguous.
/// From three-digit slots on, `(1, 112)` and `(11, 12)` share a suffix.
pub const MAX_SLOTS: u32 = 99;

/// Suffix naming the unordered pair `(a, b)`: smaller slot first.
pub fn canonical_pair_suffix(a: u32, b: u32) -> String {
    format!("{}{}", a.min(b), a.max(b))
}

/// Rooms `own_slot` joins in a call of `total_slots` participants.
///
/// Returns one room per other slot, ordered by peer slot. A slot outside
/// `1..=total_slots` is rejected instead of yielding an empty call.
pub fn peer_rooms(base: &str, own_slot: u32, total_slots: u32) -> Result<Vec<PeerRoom>, SetupError> {
    if total_slots > MAX_SLOTS {
        return Err(SetupError::TooManySlots {
            total: total_slots,
            max: MAX_SLOTS,
        });
    }
    if own_slot == 0 || own_slot > total_slots {
        return Err(SetupError::SlotOutOfRange {
            slot: own_slot,
            total: total_slots,
        });
    }

    Ok((1..=total_slots)
        .filter(|&peer| peer != own_slot)
        .map(|peer_slot| PeerRoom {
            peer_slot,
            room_id: RoomId(format!("{}{}", base, canonical_pair_suffix(own_slot, peer_slot))),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ids(rooms: &[PeerRoom]) -> Vec<&str> {
        rooms.iter().map(|r| r.room_id.as_str()).collect()
    }

    #[test]
    fn three_party_middle_slot() {
        let rooms = peer_rooms("room", 2, 3).unwrap();
        assert_eq!(ids(&rooms), vec!["room12", "room23"]);
        assert_eq!(rooms[0].peer_slot, 1);
        assert_eq!(rooms[1].peer_slot, 3);
    }

    #[test]
    fn both_ends_of_a_pair_agree() {
        for total in 2..=9 {
            for s in 1..=total {
                for room in peer_rooms("call", s, total).unwrap() {
                    let mirrored = peer_rooms("call", room.peer_slot, total).unwrap();
                    let back = mirrored.iter().find(|r| r.peer_slot == s).unwrap();
                    assert_eq!(back.room_id, room.room_id);
                }
            }
        }
    }

    #[test]
    fn no_collisions_within_a_call() {
        for total in 2..=9 {
            let mut pairs_by_room = std::collections::HashMap::new();
            for s in 1..=total {
                let rooms = peer_rooms("call", s, total).unwrap();
                assert_eq!(rooms.len() as u32, total - 1);
                let distinct: HashSet<_> = rooms.iter().map(|r| r.room_id.clone()).collect();
                assert_eq!(distinct.len(), rooms.len());
                for r in rooms {
                    let pair = (s.min(r.peer_slot), s.max(r.peer_slot));
                    let prev = pairs_by_room.insert(r.room_id.clone(), pair);
                    assert!(prev.is_none() || prev == Some(pair));
                }
            }
        }
    }

    #[test]
    fn slot_out_of_range_is_an_error() {
        assert!(matches!(
            peer_rooms("room", 0, 3),
            Err(SetupError::SlotOutOfRange { slot: 0, total: 3 })
        ));
        assert!(matches!(
            peer_rooms("room", 4, 3),
            Err(SetupError::SlotOutOfRange { slot: 4, total: 3 })
        ));
    }

    #[test]
    fn oversized_group_is_rejected() {
        assert!(matches!(
            peer_rooms("room", 1, MAX_SLOTS + 1),
            Err(SetupError::TooManySlots { .. })
        ));
        assert_eq!(peer_rooms("room", 1, MAX_SLOTS).unwrap().len() as u32, MAX_SLOTS - 1);
    }

    #[test]
    fn two_digit_slots_keep_their_order() {
        assert_eq!(canonical_pair_suffix(12, 3), "312");
        assert_eq!(canonical_pair_suffix(3, 12), "312");
    }
}
