use crate::{
    dao::models::{RoomDocument, RoomStatus},
    dto::events::ForfeitSignal,
    state::role::{Role, Seat},
};

/// Decide whether `next` means the pairing the user was part of broke up.
///
/// `paired_as` is the seat the user held when both seats were last observed filled; `None`
/// means no pairing was seen. Fires when no hand-off is in flight and either seat is now
/// empty, or, for the guest, the room turned finished. Losing one's own seat counts: the
/// opponent is gone from this user's point of view.
pub fn detect_forfeit(
    previous: Option<&RoomDocument>,
    next: &RoomDocument,
    paired_as: Option<Seat>,
    handoff_active: bool,
) -> Option<ForfeitSignal> {
    if handoff_active {
        return None;
    }
    let seat = paired_as?;
    let opponent = seat.opponent();

    let was_finished = previous.is_some_and(|prev| prev.status == RoomStatus::Finished);
    let room_finished =
        seat == Seat::Guest && next.status == RoomStatus::Finished && !was_finished;
    let pairing_broken =
        next.participant(opponent).is_none() || next.participant(seat).is_none();

    if !(pairing_broken || room_finished) {
        return None;
    }

    let opponent_name = previous
        .and_then(|prev| prev.participant_name(opponent))
        .or_else(|| next.participant_name(opponent))
        .filter(|name| !name.is_empty())
        .map(str::to_string);

    Some(ForfeitSignal {
        room_id: next.room_id.clone(),
        opponent_name,
        room_finished,
    })
}

/// Remembers the seat held while an opponent was present across snapshots.
#[derive(Debug, Default, Clone)]
pub struct ForfeitDetector {
    paired_as: Option<Seat>,
}

impl ForfeitDetector {
    /// Detector that has not seen a full room yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether both seats were seen filled since the last signal.
    pub fn had_opponent(&self) -> bool {
        self.paired_as.is_some()
    }

    /// Feed the next accepted snapshot together with the role derived from it.
    pub fn observe(
        &mut self,
        previous: Option<&RoomDocument>,
        next: &RoomDocument,
        role: Role,
        handoff_active: bool,
    ) -> Option<ForfeitSignal> {
        let signal = detect_forfeit(previous, next, self.paired_as, handoff_active);
        if signal.is_some() {
            self.paired_as = None;
        } else if next.both_seats_filled() {
            self.paired_as = role.seat();
        }
        signal
    }
}
