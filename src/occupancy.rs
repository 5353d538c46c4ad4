//! Slot occupancy from one frame's detections.
//!
//! A detection marks every slot whose region contains its box centroid.
//! Overlapping slot regions can therefore be marked by the same vehicle.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Local};

use crate::detect::Detection;
use crate::error::PipelineError;
use crate::geometry::{BBox, Point, Polygon};

#[derive(Clone, Debug, PartialEq)]
pub enum SlotRegion {
    Box(BBox),
    Polygon(Polygon),
}

impl SlotRegion {
    pub fn contains(&self, point: Point) -> bool {
        match self {
            Self::Box(bbox) => bbox.contains(point),
            Self::Polygon(polygon) => polygon.contains(point),
        }
    }
}

/// A configured parking space.
#[derive(Clone, Debug, PartialEq)]
pub struct ParkingSlot {
    pub id: u32,
    pub region: SlotRegion,
}

impl ParkingSlot {
    pub fn with_box(id: u32, bbox: BBox) -> Self {
        Self {
            id,
            region: SlotRegion::Box(bbox),
        }
    }

    pub fn with_polygon(id: u32, polygon: Polygon) -> Self {
        Self {
            id,
            region: SlotRegion::Polygon(polygon),
        }
    }

    pub fn contains(&self, point: Point) -> bool {
        self.region.contains(point)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OccupancySnapshot {
    pub total_slots: usize,
    pub occupied_slot_ids: BTreeSet<u32>,
    pub timestamp: DateTime<Local>,
}

impl OccupancySnapshot {
    pub fn occupied_count(&self) -> usize {
        self.occupied_slot_ids.len()
    }

    pub fn free_count(&self) -> usize {
        self.total_slots.saturating_sub(self.occupied_count())
    }
}

/// Maps detections onto the fixed set of configured slots.
#[derive(Clone, Debug)]
pub struct OccupancyMapper {
    slots: Vec<ParkingSlot>,
}

impl OccupancyMapper {
    /// Slot ids must be unique; an empty slot list is allowed but callers
    /// normally bypass the mapper and count raw detections instead.
    pub fn new(slots: Vec<ParkingSlot>) -> Result<Self, PipelineError> {
        let mut seen = HashSet::with_capacity(slots.len());
        for slot in &slots {
            if !seen.insert(slot.id) {
                return Err(PipelineError::configuration(format!(
                    "duplicate parking slot id {}",
                    slot.id
                )));
            }
        }
        Ok(Self { slots })
    }

    pub fn slots(&self) -> &[ParkingSlot] {
        &self.slots
    }

    pub fn total_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn map(&self, detections: &[Detection], timestamp: DateTime<Local>) -> OccupancySnapshot {
        let mut occupied = BTreeSet::new();
        for det in detections {
            let centroid = det.bbox.centroid();
            for slot in &self.slots {
                if slot.contains(centroid) {
                    occupied.insert(slot.id);
                }
            }
        }
        OccupancySnapshot {
            total_slots: self.slots.len(),
            occupied_slot_ids: occupied,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x1: f64, y1: f64, x2: f64, y2: f64) -> BBox {
        BBox::new(x1, y1, x2, y2).unwrap()
    }

    fn car(x1: f64, y1: f64, x2: f64, y2: f64) -> Detection {
        Detection::new(2, "car", 0.9, bbox(x1, y1, x2, y2)).unwrap()
    }

    /// 16 slots in a 4x4 grid of 50px cells; slot 1 is (0,0)-(50,50).
    fn grid() -> OccupancyMapper {
        let slots = (0..16)
            .map(|i| {
                let (col, row) = ((i % 4) as f64, (i / 4) as f64);
                ParkingSlot::with_box(
                    i + 1,
                    bbox(col * 60.0, row * 60.0, col * 60.0 + 50.0, row * 60.0 + 50.0),
                )
            })
            .collect();
        OccupancyMapper::new(slots).unwrap()
    }

    #[test]
    fn single_vehicle_in_sixteen_slot_lot() {
        let snapshot = grid().map(&[car(10.0, 10.0, 40.0, 40.0)], Local::now());
        assert_eq!(snapshot.total_slots, 16);
        assert_eq!(snapshot.occupied_slot_ids, BTreeSet::from([1]));
        assert_eq!(snapshot.free_count(), 15);
    }

    #[test]
    fn vehicles_between_slots_mark_nothing() {
        let snapshot = grid().map(&[car(45.0, 45.0, 65.0, 65.0)], Local::now());
        assert!(snapshot.occupied_slot_ids.is_empty());
        assert_eq!(snapshot.free_count(), 16);
    }

    #[test]
    fn overlapping_slots_are_all_marked() {
        let mapper = OccupancyMapper::new(vec![
            ParkingSlot::with_box(1, bbox(0.0, 0.0, 50.0, 50.0)),
            ParkingSlot::with_box(2, bbox(20.0, 20.0, 80.0, 80.0)),
            ParkingSlot::with_box(3, bbox(100.0, 100.0, 150.0, 150.0)),
        ])
        .unwrap();
        let snapshot = mapper.map(&[car(20.0, 20.0, 40.0, 40.0)], Local::now());
        assert_eq!(snapshot.occupied_slot_ids, BTreeSet::from([1, 2]));
    }

    #[test]
    fn polygon_slots_use_the_centroid() {
        let triangle = Polygon::from_pairs(&[[0.0, 0.0], [100.0, 0.0], [0.0, 100.0]]).unwrap();
        let mapper = OccupancyMapper::new(vec![ParkingSlot::with_polygon(9, triangle)]).unwrap();
        assert_eq!(mapper.map(&[car(10.0, 10.0, 30.0, 30.0)], Local::now()).occupied_count(), 1);
        assert_eq!(mapper.map(&[car(60.0, 60.0, 90.0, 90.0)], Local::now()).occupied_count(), 0);
    }

    #[test]
    fn occupied_ids_stay_within_configured_slots() {
        let mapper = grid();
        let ids: BTreeSet<u32> = mapper.slots().iter().map(|s| s.id).collect();
        let detections: Vec<Detection> = (0..40)
            .map(|i| {
                let x = (i * 17 % 240) as f64;
                let y = (i * 29 % 240) as f64;
                car(x, y, x + 20.0, y + 20.0)
            })
            .collect();
        let snapshot = mapper.map(&detections, Local::now());
        assert!(snapshot.occupied_slot_ids.is_subset(&ids));
        assert!(snapshot.occupied_count() <= snapshot.total_slots);
    }

    #[test]
    fn duplicate_slot_ids_are_rejected() {
        let err = OccupancyMapper::new(vec![
            ParkingSlot::with_box(4, bbox(0.0, 0.0, 1.0, 1.0)),
            ParkingSlot::with_box(4, bbox(2.0, 2.0, 3.0, 3.0)),
        ])
        .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }
}
