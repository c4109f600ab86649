//! Identifier generation.
//!
//! Every record id is a millisecond timestamp plus a short random tail,
//! so ids sort by creation time and never collide within a process. The
//! one exception is child naming: children take the hierarchical
//! `PPP-CCC` form derived from the parent so siblings are deterministic.

use rand::Rng;

/// Width of the random tail, in hex digits.
const TAIL_HEX: usize = 6;

/// Current timestamp in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn tail() -> String {
    let r: u32 = rand::rng().random();
    format!("{:0width$x}", r & 0xff_ffff, width = TAIL_HEX)
}

/// `[prefix-]{timestamp_ms}-{tail}`; the shared shape behind every
/// non-child id.
fn stamped(prefix: &str) -> String {
    let mut id = String::new();
    if !prefix.is_empty() {
        id.push_str(prefix);
        id.push('-');
    }
    id.push_str(&now_ms().to_string());
    id.push('-');
    id.push_str(&tail());
    id
}

/// Root loop id (no prefix; loops are the primary entity).
pub fn loop_id() -> String {
    stamped("")
}

pub fn signal_id() -> String {
    stamped("sig")
}

pub fn event_id() -> String {
    stamped("evt")
}

pub fn merge_id() -> String {
    stamped("merge")
}

/// Tool job id, traceable to its loop and iteration:
/// `job-{loop_id}-{iteration}-{tail}`.
pub fn job_id(loop_id: &str, iteration: u32) -> String {
    format!("job-{}-{}-{}", loop_id, iteration, tail())
}

/// Child id in the hierarchical `PPP-CCC` form.
///
/// Only the parent's final segment carries forward, so a grandchild of
/// `1754070000000-b07c1d` reads `b07c1d-002-001` worth of history at a
/// glance without unbounded growth.
pub fn child_id(parent_id: &str, index: u32) -> String {
    let suffix = match parent_id.rfind('-') {
        Some(cut) => &parent_id[cut + 1..],
        None => parent_id,
    };
    format!("{}-{:03}", suffix, index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn assert_stamped_shape(id: &str, prefix: &str) {
        let body = if prefix.is_empty() {
            id
        } else {
            id.strip_prefix(&format!("{}-", prefix))
                .unwrap_or_else(|| panic!("{} lacks prefix {}", id, prefix))
        };
        let (ts, tail) = body.split_once('-').expect("timestamp-tail shape");
        assert!(ts.chars().all(|c| c.is_ascii_digit()), "{}", id);
        assert_eq!(tail.len(), TAIL_HEX, "{}", id);
        assert!(tail.chars().all(|c| c.is_ascii_hexdigit()), "{}", id);
    }

    #[test]
    fn test_now_ms_is_current_era() {
        let ts = now_ms();
        assert!(ts > 1_700_000_000_000); // after late 2023
        assert!(ts < 2_000_000_000_000); // before 2033
    }

    #[test]
    fn test_every_kind_shares_the_stamped_shape() {
        assert_stamped_shape(&loop_id(), "");
        assert_stamped_shape(&signal_id(), "sig");
        assert_stamped_shape(&event_id(), "evt");
        assert_stamped_shape(&merge_id(), "merge");
    }

    #[test]
    fn test_ids_unique_in_bulk() {
        let ids: HashSet<String> = (0..200).map(|_| loop_id()).collect();
        assert_eq!(ids.len(), 200);
    }

    #[test]
    fn test_loop_ids_order_by_creation() {
        let earlier = loop_id();
        std::thread::sleep(std::time::Duration::from_millis(3));
        let later = loop_id();
        assert!(earlier < later);
    }

    #[test]
    fn test_job_id_traceable() {
        let id = job_id("b07c1d-002", 4);
        assert!(id.starts_with("job-b07c1d-002-4-"));
        let tail = id.rsplit('-').next().unwrap();
        assert_eq!(tail.len(), TAIL_HEX);
    }

    #[test]
    fn test_child_id_keeps_final_segment_only() {
        assert_eq!(child_id("1754070000000-b07c1d", 2), "b07c1d-002");
    }

    #[test]
    fn test_child_id_zero_pads_index() {
        assert_eq!(child_id("b07c1d-002", 14), "002-014");
    }

    #[test]
    fn test_child_id_of_unsegmented_parent() {
        assert_eq!(child_id("root", 3), "root-003");
    }

    #[test]
    fn test_sibling_ids_are_deterministic() {
        let parent = "1754070000000-b07c1d";
        assert_eq!(child_id(parent, 1), child_id(parent, 1));
        assert_ne!(child_id(parent, 1), child_id(parent, 2));
    }

    #[test]
    fn test_three_generations_chain() {
        let plan = "1754070000000-b07c1d";
        let spec = child_id(plan, 2);
        let phase = child_id(&spec, 1);
        let code = child_id(&phase, 1);
        assert_eq!(spec, "b07c1d-002");
        assert_eq!(phase, "002-001");
        assert_eq!(code, "001-001");
    }
}
