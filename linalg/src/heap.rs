use crate::Scalar;

// BOUNDED-HEAP SELECT
// ================================================================================================

/// Folds candidate `(distance, gid)` pairs into a bounded neighbor list.
///
/// `heap` is a fixed-size max-heap ordered by distance with the current worst
/// neighbor at index 0; a candidate replaces the root only when it is
/// strictly closer. Columns of a neighbor table are maintained exactly this
/// way, seeded with `(T::max_value(), sentinel)` entries so the first `k`
/// candidates always land.
pub fn heap_select<T: Scalar>(candidates: &[(T, usize)], heap: &mut [(T, usize)]) {
    for &candidate in candidates {
        if candidate.0 < heap[0].0 {
            heap[0] = candidate;
            sift_down(heap, 0);
        }
    }
}

fn sift_down<T: Scalar>(heap: &mut [(T, usize)], mut at: usize) {
    loop {
        let left = 2 * at + 1;
        let right = 2 * at + 2;
        let mut largest = at;

        if left < heap.len() && heap[left].0 > heap[largest].0 {
            largest = left;
        }
        if right < heap.len() && heap[right].0 > heap[largest].0 {
            largest = right;
        }
        if largest == at {
            return;
        }
        heap.swap(at, largest);
        at = largest;
    }
}

// TESTS
// ================================================================================================
