use crate::model::*;

// ── Free-window algebra ──────────────────────────────────────────

/// Free sub-spans of `query` on a room: the query window minus every
/// occupying reservation, clamped to the window.
pub fn free_spans(rs: &RoomState, query: &Span) -> Vec<Span> {
    let mut taken: Vec<Span> = rs
        .overlapping(query)
        .map(|i| Span::new(i.span.start.max(query.start), i.span.end.min(query.end)))
        .collect();
    if taken.is_empty() {
        return vec![*query];
    }
    taken.sort_by_key(|s| s.start);
    subtract_intervals(&[*query], &merge_overlapping(&taken))
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start; `to_remove` disjoint.
fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
