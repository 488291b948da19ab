use eframe::egui;

/// Axis direction from one anchor towards another, used to pick the natural
/// connection side of a boundary rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Right,
    Up,
    Left,
    Down,
}

/// Picks the side of `from` facing `to`.
///
/// Overlapping axis intervals decide the near-vertical/near-horizontal cases
/// where the raw center angle would flip unstably; elsewhere plain angle-range
/// membership (45 degree sectors) applies.
pub fn natural_side(from: egui::Rect, to: egui::Rect) -> Side {
    let h_overlap = from.left() < to.right() && to.left() < from.right();
    let v_overlap = from.top() < to.bottom() && to.top() < from.bottom();

    if v_overlap && !h_overlap {
        return if to.center().x > from.center().x {
            Side::Right
        } else {
            Side::Left
        };
    }
    if h_overlap && !v_overlap {
        return if to.center().y > from.center().y {
            Side::Down
        } else {
            Side::Up
        };
    }

    let d = to.center() - from.center();
    if d.x.abs() >= d.y.abs() {
        if d.x >= 0.0 { Side::Right } else { Side::Left }
    } else if d.y >= 0.0 {
        Side::Down
    } else {
        Side::Up
    }
}

pub fn side_midpoint(rect: egui::Rect, side: Side) -> egui::Pos2 {
    match side {
        Side::Right => egui::Pos2::new(rect.right(), rect.center().y),
        Side::Left => egui::Pos2::new(rect.left(), rect.center().y),
        Side::Up => egui::Pos2::new(rect.center().x, rect.top()),
        Side::Down => egui::Pos2::new(rect.center().x, rect.bottom()),
    }
}

/// The nominal line between two anchors: each end is the midpoint of the side
/// facing the other anchor.
pub fn natural_connection_line(a: egui::Rect, b: egui::Rect) -> (egui::Pos2, egui::Pos2) {
    (
        side_midpoint(a, natural_side(a, b)),
        side_midpoint(b, natural_side(b, a)),
    )
}

fn segment_intersection(
    p1: egui::Pos2,
    p2: egui::Pos2,
    q1: egui::Pos2,
    q2: egui::Pos2,
) -> Option<egui::Pos2> {
    let r = p2 - p1;
    let s = q2 - q1;
    let denom = r.x * s.y - r.y * s.x;
    if denom.abs() <= f32::EPSILON {
        return None;
    }
    let qp = q1 - p1;
    let t = (qp.x * s.y - qp.y * s.x) / denom;
    let u = (qp.x * r.y - qp.y * r.x) / denom;
    if (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u) {
        Some(p1 + r * t)
    } else {
        None
    }
}

fn edges(rect: egui::Rect) -> [(egui::Pos2, egui::Pos2); 4] {
    [
        (rect.left_top(), rect.right_top()),
        (rect.right_top(), rect.right_bottom()),
        (rect.right_bottom(), rect.left_bottom()),
        (rect.left_bottom(), rect.left_top()),
    ]
}

/// Where a link visually attaches to `anchor`, given the nominal line between
/// the two endpoints' natural connection points.
///
/// Exactly one bounded edge intersection wins outright; with several (the line
/// crosses the whole rectangle, or passes through a corner) the one closer to
/// `other_end` wins, yielding the shorter segment; with none (overlapping
/// anchors) the center is the fallback.
pub fn boundary_contact_point(
    anchor: egui::Rect,
    line: (egui::Pos2, egui::Pos2),
    other_end: egui::Pos2,
) -> egui::Pos2 {
    let mut hits: Vec<egui::Pos2> = Vec::with_capacity(2);
    for (a, b) in edges(anchor) {
        if let Some(hit) = segment_intersection(line.0, line.1, a, b) {
            hits.push(hit);
        }
    }
    match hits.len() {
        0 => anchor.center(),
        1 => hits[0],
        _ => hits
            .into_iter()
            .min_by(|a, b| a.distance(other_end).total_cmp(&b.distance(other_end)))
            .unwrap_or_else(|| anchor.center()),
    }
}

/// Debug/visualization alternative: the midpoint of whichever side the line
/// crosses, ignoring the connection angle entirely.
pub fn mid_locked_contact_point(
    anchor: egui::Rect,
    line: (egui::Pos2, egui::Pos2),
    other_end: egui::Pos2,
) -> egui::Pos2 {
    let mut best: Option<(f32, egui::Pos2)> = None;
    for (a, b) in edges(anchor) {
        if let Some(hit) = segment_intersection(line.0, line.1, a, b) {
            let d = hit.distance(other_end);
            if best.is_none_or(|(bd, _)| d < bd) {
                best = Some((d, (a + b.to_vec2()) / 2.0));
            }
        }
    }
    best.map(|(_, mid)| mid).unwrap_or_else(|| anchor.center())
}

pub fn contact_point(
    anchor: egui::Rect,
    line: (egui::Pos2, egui::Pos2),
    other_end: egui::Pos2,
    mid_locked: bool,
) -> egui::Pos2 {
    if mid_locked {
        mid_locked_contact_point(anchor, line, other_end)
    } else {
        boundary_contact_point(anchor, line, other_end)
    }
}

/// Perpendicular offset separating the `index`-th of `count` parallel links
/// between the same two endpoints.
pub fn parallel_offset(
    from: egui::Pos2,
    to: egui::Pos2,
    index: usize,
    count: usize,
    spacing: f32,
) -> egui::Vec2 {
    let d = to - from;
    let len = d.length();
    if len <= f32::EPSILON || count < 2 {
        return egui::Vec2::ZERO;
    }
    let normal = egui::Vec2::new(-d.y / len, d.x / len);
    let lane = index as f32 - (count as f32 - 1.0) / 2.0;
    normal * lane * spacing
}

pub fn dist_to_segment(p: egui::Pos2, a: egui::Pos2, b: egui::Pos2) -> f32 {
    let ab = b - a;
    let l2 = ab.length_sq();
    if l2 == 0.0 {
        return p.distance(a);
    }
    let t = ((p - a).dot(ab) / l2).clamp(0.0, 1.0);
    p.distance(a + ab * t)
}

pub fn overlap_area(a: egui::Rect, b: egui::Rect) -> f32 {
    let w = a.right().min(b.right()) - a.left().max(b.left());
    let h = a.bottom().min(b.bottom()) - a.top().max(b.top());
    if w <= 0.0 || h <= 0.0 { 0.0 } else { w * h }
}
