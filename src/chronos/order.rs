//! Ordering helpers over timestamp sequences kept in descending order
//! (most recent first).

use crate::store::Timestamp;

/// Stable sort, most recent first.
pub fn sort(seq: &mut [Timestamp]) {
    sort_by_key(seq, |t| t);
}

pub fn sort_by_key<T, F>(seq: &mut [T], key: F)
where
    F: Fn(&T) -> &Timestamp,
{
    seq.sort_by(|a, b| key(b).cmp(key(a)));
}

/// Index of the most recent element at or before `x`, or `None` when every
/// element is after `x`. `seq` must be sorted descending.
pub fn floor_search(seq: &[Timestamp], x: &Timestamp) -> Option<usize> {
    floor_search_by_key(seq, x, |t| t)
}

pub fn floor_search_by_key<T, F>(seq: &[T], x: &Timestamp, key: F) -> Option<usize>
where
    F: Fn(&T) -> &Timestamp,
{
    let n = seq.partition_point(|e| key(e) > x);
    (n < seq.len()).then_some(n)
}

/// Index of an element equal to `x`.
pub fn exact_search(seq: &[Timestamp], x: &Timestamp) -> Option<usize> {
    exact_search_by_key(seq, x, |t| t)
}

pub fn exact_search_by_key<T, F>(seq: &[T], x: &Timestamp, key: F) -> Option<usize>
where
    F: Fn(&T) -> &Timestamp,
{
    floor_search_by_key(seq, x, &key).filter(|&n| key(&seq[n]) == x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn ts(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_sort_descending() {
        let mut seq = vec![ts(5), ts(1), ts(20), ts(10)];
        sort(&mut seq);
        assert_eq!(seq, vec![ts(20), ts(10), ts(5), ts(1)]);
    }

    #[test]
    fn test_sort_is_stable() {
        let mut seq = vec![(ts(1), 'a'), (ts(2), 'b'), (ts(1), 'c')];
        sort_by_key(&mut seq, |e| &e.0);
        assert_eq!(seq, vec![(ts(2), 'b'), (ts(1), 'a'), (ts(1), 'c')]);
    }

    #[test]
    fn test_floor_search() {
        let seq = vec![ts(25), ts(20), ts(15), ts(10), ts(5)];
        assert_eq!(floor_search(&seq, &ts(25)), Some(0));
        assert_eq!(floor_search(&seq, &ts(100)), Some(0));
        assert_eq!(floor_search(&seq, &ts(17)), Some(2));
        assert_eq!(floor_search(&seq, &ts(5)), Some(4));
        assert_eq!(floor_search(&seq, &ts(4)), None);
    }

    #[test]
    fn test_floor_search_sub_second() {
        let seq = vec![ts(1), ts(0)];
        let just_before = ts(1) - Duration::nanoseconds(1);
        assert_eq!(floor_search(&seq, &just_before), Some(1));
    }

    #[test]
    fn test_floor_search_empty() {
        assert_eq!(floor_search(&[], &ts(0)), None);
    }

    #[test]
    fn test_exact_search() {
        let seq = vec![ts(20), ts(10), ts(5)];
        assert_eq!(exact_search(&seq, &ts(10)), Some(1));
        assert_eq!(exact_search(&seq, &ts(11)), None);
        assert_eq!(exact_search(&seq, &ts(1)), None);
        assert_eq!(exact_search(&seq, &ts(30)), None);
    }
}
