use serde::{Deserialize, Serialize};

/// Tunables for the interaction surface, loadable from the application's
/// settings file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Hit radius for waypoints, vertices and link polylines, in scene units.
    pub hit_radius: f32,
    /// Half extent of the square link-target marker following the cursor.
    pub marker_half_extent: f32,
    /// Minimum cursor travel before a press turns into a drag.
    pub drag_threshold: f32,
    /// Maximum viewport center distance (px) still counting as "same view"
    /// when undo/redo compares saved and live viewports.
    pub viewport_pos_tolerance: f32,
    pub viewport_zoom_tolerance: f32,
    /// How much the first/last segment is shortened in decluttered display.
    pub declutter_length: f32,
    /// Perpendicular spacing between parallel links sharing both endpoints.
    pub parallel_link_spacing: f32,
    /// Retry budget for selection requests targeting a port item that does
    /// not exist yet.
    pub ifx_tracker_max_retries: u32,
    /// Use the side-midpoint contact rule instead of the angled one.
    pub mid_locked_contacts: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hit_radius: 5.0,
            marker_half_extent: 8.0,
            drag_threshold: 3.0,
            viewport_pos_tolerance: 10.0,
            viewport_zoom_tolerance: 0.01,
            declutter_length: 20.0,
            parallel_link_spacing: 6.0,
            ifx_tracker_max_retries: 10,
            mid_locked_contacts: false,
        }
    }
}

impl Settings {
    pub fn from_toml(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let s = Settings::from_toml("hit_radius = 9.5\nmid_locked_contacts = true\n").unwrap();
        assert_eq!(s.hit_radius, 9.5);
        assert!(s.mid_locked_contacts);
        assert_eq!(s.marker_half_extent, Settings::default().marker_half_extent);
    }

    #[test]
    fn test_toml_round_trip() {
        let s = Settings::default();
        let parsed = Settings::from_toml(&s.to_toml()).unwrap();
        assert_eq!(parsed, s);
    }
}
