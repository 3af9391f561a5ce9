use crate::model::*;

// ── Availability resolution ──────────────────────────────────────

/// First interval, in the order given, whose half-open range contains `t`.
pub fn occupant_at(t: Minutes, occupied: &[OccupiedInterval]) -> Option<&Occupant> {
    occupied
        .iter()
        .find(|interval| interval.covers(t))
        .map(|interval| &interval.occupant)
}

/// Occupancy is decided by the slot's start instant alone. A slot whose
/// start is free but whose tail runs into an appointment still reads `Free`.
pub fn status_of(slot: &Slot, occupied: &[OccupiedInterval]) -> Status {
    match occupant_at(slot.start, occupied) {
        Some(occupant) => Status::Occupied(occupant.clone()),
        None => Status::Free,
    }
}

/// Annotate every slot as free or occupied. Total and order-preserving.
pub fn resolve(slots: &[Slot], occupied: &[OccupiedInterval]) -> Vec<SlotStatus> {
    slots
        .iter()
        .map(|slot| SlotStatus {
            slot: *slot,
            status: status_of(slot, occupied),
        })
        .collect()
}
