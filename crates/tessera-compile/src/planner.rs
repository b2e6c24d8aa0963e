//! Greedy interval colouring of tensors into arena offsets.
//!
//! Requests are visited by interval start (then request order). A request
//! takes the lowest-offset existing slot that is large enough and whose
//! last occupant died strictly before the request starts; otherwise a new
//! slot is appended. Reserved requests always get a fresh slot that is never
//! handed out again.

use crate::liveness::Interval;

/// One tensor to place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanRequest {
    pub size: usize,
    pub interval: Interval,
    /// Never share this tensor's bytes (bound, pinned or caller-set).
    pub reserved: bool,
}

/// Result of [`assign`]: one region-relative offset per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub offsets: Vec<usize>,
    pub size: usize,
}

#[derive(Debug)]
struct SlotState {
    offset: usize,
    size: usize,
    busy_until: usize,
    reserved: bool,
}

pub fn align_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Places `requests` in a region starting at offset 0.
pub fn assign(requests: &[PlanRequest], alignment: usize, reuse: bool) -> Plan {
    let mut visit: Vec<usize> = (0..requests.len()).collect();
    visit.sort_by_key(|i| (requests[*i].interval.start, *i));

    let mut slots: Vec<SlotState> = Vec::new();
    let mut offsets = vec![0; requests.len()];
    let mut size = 0;

    for i in visit {
        let request = &requests[i];
        let need = align_up(request.size.max(1), alignment);

        let reusable = if reuse && !request.reserved {
            slots
                .iter_mut()
                .filter(|s| !s.reserved && s.busy_until < request.interval.start && s.size >= need)
                .min_by_key(|s| s.offset)
        } else {
            None
        };

        offsets[i] = match reusable {
            Some(slot) => {
                slot.busy_until = request.interval.end;
                slot.offset
            }
            None => {
                let offset = size;
                size += need;
                slots.push(SlotState {
                    offset,
                    size: need,
                    busy_until: request.interval.end,
                    reserved: request.reserved,
                });
                offset
            }
        };
    }

    Plan { offsets, size }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(size: usize, start: usize, end: usize) -> PlanRequest {
        PlanRequest {
            size,
            interval: Interval::new(start, end),
            reserved: false,
        }
    }

    #[test]
    fn disjoint_intervals_share_a_slot() {
        let plan = assign(&[request(16, 0, 1), request(16, 2, 3)], 16, true);
        assert_eq!(plan.offsets, vec![0, 0]);
        assert_eq!(plan.size, 16);
    }

    #[test]
    fn touching_intervals_do_not_share() {
        let plan = assign(&[request(16, 0, 1), request(16, 1, 2)], 16, true);
        assert_eq!(plan.offsets, vec![0, 16]);
    }

    #[test]
    fn smallest_offset_wins_and_size_must_fit() {
        let plan = assign(
            &[
                request(32, 0, 0),
                request(16, 0, 0),
                request(16, 1, 2),
                request(64, 1, 2),
            ],
            16,
            true,
        );
        // Third request fits in the 32-byte slot at offset 0; the 64-byte one
        // fits nowhere and is appended.
        assert_eq!(plan.offsets, vec![0, 32, 0, 48]);
        assert_eq!(plan.size, 112);
    }

    #[test]
    fn reserved_and_no_reuse() {
        let mut pinned = request(16, 0, 0);
        pinned.reserved = true;
        let plan = assign(&[pinned, request(16, 1, 1)], 16, true);
        assert_eq!(plan.offsets, vec![0, 16]);

        let plan = assign(&[request(16, 0, 0), request(16, 1, 1)], 16, false);
        assert_eq!(plan.offsets, vec![0, 16]);
    }

    #[test]
    fn alignment_rounds_sizes() {
        let plan = assign(&[request(4, 0, 3), request(4, 0, 3)], 64, true);
        assert_eq!(plan.offsets, vec![0, 64]);
        assert_eq!(align_up(65, 64), 128);
    }
}
