//! Polygonal zones.
//!
//! Zones are closed polygons in frame pixel coordinates with an id, a kind
//! tag, and an occupancy capacity. Geometry is validated at construction;
//! a polygon with fewer than three vertices is a configuration error.

use anyhow::{anyhow, Result};

use crate::config::ZoneSettings;
use crate::validate_identifier;

#[derive(Clone, Debug)]
pub struct Zone {
    pub id: String,
    pub kind: String,
    /// Occupancy above this marks count updates as anomalous.
    pub capacity: usize,
    points: Vec<[f32; 2]>,
}

impl Zone {
    /// Ray-casting point-in-polygon test. Points on an edge count as
    /// inside on one side only, which is stable enough for box centers.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        let mut inside = false;
        let n = self.points.len();
        let mut j = n - 1;
        for i in 0..n {
            let [xi, yi] = self.points[i];
            let [xj, yj] = self.points[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

/// All configured zones, in declaration order.
#[derive(Clone, Debug, Default)]
pub struct ZoneSet {
    zones: Vec<Zone>,
}

impl ZoneSet {
    pub fn from_settings(settings: &[ZoneSettings]) -> Result<Self> {
        let mut zones = Vec::with_capacity(settings.len());
        let mut seen = std::collections::HashSet::new();
        for s in settings {
            validate_identifier(&s.id).map_err(|e| anyhow!("zone id: {}", e))?;
            let id = s.id.to_lowercase();
            if !seen.insert(id.clone()) {
                return Err(anyhow!("duplicate zone id '{}'", id));
            }
            if s.points.len() < 3 {
                return Err(anyhow!(
                    "zone '{}' has {} vertices, need at least 3",
                    id,
                    s.points.len()
                ));
            }
            zones.push(Zone {
                id,
                kind: s.kind.clone(),
                capacity: s.capacity,
                points: s.points.clone(),
            });
        }
        Ok(Self { zones })
    }

    /// First zone containing the point, in declaration order.
    pub fn locate(&self, x: f32, y: f32) -> Option<&Zone> {
        self.zones.iter().find(|z| z.contains(x, y))
    }

    pub fn get(&self, id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(id: &str, x0: f32, y0: f32, side: f32) -> ZoneSettings {
        ZoneSettings {
            id: id.to_string(),
            kind: "generic".to_string(),
            capacity: usize::MAX,
            points: vec![
                [x0, y0],
                [x0 + side, y0],
                [x0 + side, y0 + side],
                [x0, y0 + side],
            ],
        }
    }

    #[test]
    fn contains_square_interior_not_exterior() {
        let set = ZoneSet::from_settings(&[square("desk_1", 100.0, 100.0, 50.0)]).unwrap();
        let zone = set.get("desk_1").unwrap();
        assert!(zone.contains(125.0, 125.0));
        assert!(!zone.contains(99.0, 125.0));
        assert!(!zone.contains(125.0, 151.0));
    }

    #[test]
    fn degenerate_polygon_is_rejected() {
        let mut s = square("desk_1", 0.0, 0.0, 10.0);
        s.points.truncate(2);
        assert!(ZoneSet::from_settings(&[s]).is_err());
    }

    #[test]
    fn duplicate_zone_ids_are_rejected() {
        let zones = [square("desk_1", 0.0, 0.0, 10.0), square("DESK_1", 50.0, 0.0, 10.0)];
        assert!(ZoneSet::from_settings(&zones).is_err());
    }

    #[test]
    fn locate_prefers_declaration_order_on_overlap() {
        let set = ZoneSet::from_settings(&[
            square("outer", 0.0, 0.0, 100.0),
            square("inner", 25.0, 25.0, 50.0),
        ])
        .unwrap();
        assert_eq!(set.locate(50.0, 50.0).unwrap().id, "outer");
        assert!(set.locate(500.0, 500.0).is_none());
    }
}
