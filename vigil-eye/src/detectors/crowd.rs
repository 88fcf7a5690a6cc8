//! Overcrowding detection
//!
//! Person centres are bucketed into a grid; any cell holding `threshold` or more people
//! triggers. The outcome also carries a per-direction breakdown for consumers that ask
//! questions like "how busy is the north-east corner".

use super::people::{PersonBox, PersonLocator};
use super::{DetectionMetadata, Detector, DetectorId, Evaluation};
use crate::config::CrowdConfig;
use crate::error::Result;
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    North,
    South,
    East,
    West,
    NorthEast,
    NorthWest,
    SouthEast,
    SouthWest,
}

impl Direction {
    pub const ALL: [Direction; 8] = [
        Direction::North,
        Direction::South,
        Direction::East,
        Direction::West,
        Direction::NorthEast,
        Direction::NorthWest,
        Direction::SouthEast,
        Direction::SouthWest,
    ];

    /// Region `(x1, y1, x2, y2)` of a `width x height` frame, half-open on the far edges.
    /// Cardinal regions are frame halves, diagonal ones are quadrants.
    pub fn region(self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let (hw, hh) = (width / 2, height / 2);
        match self {
            Direction::North => (0, 0, width, hh),
            Direction::South => (0, hh, width, height),
            Direction::East => (hw, 0, width, height),
            Direction::West => (0, 0, hw, height),
            Direction::NorthEast => (hw, 0, width, hh),
            Direction::NorthWest => (0, 0, hw, hh),
            Direction::SouthEast => (hw, hh, width, height),
            Direction::SouthWest => (0, hh, hw, height),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let normalized: String = name
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match normalized.as_str() {
            "north" | "n" => Some(Direction::North),
            "south" | "s" => Some(Direction::South),
            "east" | "e" => Some(Direction::East),
            "west" | "w" => Some(Direction::West),
            "northeast" | "ne" => Some(Direction::NorthEast),
            "northwest" | "nw" => Some(Direction::NorthWest),
            "southeast" | "se" => Some(Direction::SouthEast),
            "southwest" | "sw" => Some(Direction::SouthWest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrowdLevel {
    Low,
    Medium,
    High,
}

impl CrowdLevel {
    pub fn from_count(count: u32) -> Self {
        if count > 10 {
            CrowdLevel::High
        } else if count > 5 {
            CrowdLevel::Medium
        } else {
            CrowdLevel::Low
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionStats {
    pub count: u32,
    /// People per 10k pixels of the region
    pub density: f32,
    pub level: CrowdLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrowdMetadata {
    pub people: u32,
    /// `grid_rows` rows of `grid_cols` counts
    pub cell_counts: Vec<Vec<u32>>,
    pub directions: BTreeMap<Direction, DirectionStats>,
    pub level: CrowdLevel,
    /// Most populated direction, if anyone is in view
    pub busiest: Option<Direction>,
}

pub struct CrowdDetector {
    locator: Arc<dyn PersonLocator>,
    config: CrowdConfig,
}

impl CrowdDetector {
    pub fn new(locator: Arc<dyn PersonLocator>, config: CrowdConfig) -> Self {
        Self { locator, config }
    }

    fn grid_counts(&self, boxes: &[PersonBox], width: u32, height: u32) -> Vec<Vec<u32>> {
        let rows = self.config.grid_rows.max(1);
        let cols = self.config.grid_cols.max(1);
        let mut cells = vec![vec![0u32; cols as usize]; rows as usize];

        for person in boxes {
            let (cx, cy) = person.centre();
            let cx = cx.max(0.0) as u64;
            let cy = cy.max(0.0) as u64;
            let row = ((cy * rows as u64) / height.max(1) as u64).min(rows as u64 - 1) as usize;
            let col = ((cx * cols as u64) / width.max(1) as u64).min(cols as u64 - 1) as usize;
            cells[row][col] += 1;
        }
        cells
    }
}

/// Per-direction crowd breakdown of `boxes` in a `width x height` frame
pub fn direction_stats(
    boxes: &[PersonBox],
    width: u32,
    height: u32,
) -> BTreeMap<Direction, DirectionStats> {
    Direction::ALL
        .iter()
        .map(|&direction| {
            let (x1, y1, x2, y2) = direction.region(width, height);
            let count = boxes
                .iter()
                .filter(|person| {
                    let (cx, cy) = person.centre();
                    cx >= x1 as f32 && cx < x2 as f32 && cy >= y1 as f32 && cy < y2 as f32
                })
                .count() as u32;
            let area = (x2 - x1) as f32 * (y2 - y1) as f32;
            let density = if area > 0.0 {
                count as f32 / (area / 10_000.0)
            } else {
                0.0
            };
            (
                direction,
                DirectionStats {
                    count,
                    density,
                    level: CrowdLevel::from_count(count),
                },
            )
        })
        .collect()
}

impl Detector for CrowdDetector {
    fn id(&self) -> DetectorId {
        DetectorId::new(DetectorId::CROWD)
    }

    fn evaluate(&self, frame: &Frame) -> Result<Evaluation> {
        let boxes = self.locator.locate(frame)?;
        let cell_counts = self.grid_counts(&boxes, frame.width(), frame.height());
        let triggered = cell_counts
            .iter()
            .flatten()
            .any(|&count| count >= self.config.threshold);

        let directions = direction_stats(&boxes, frame.width(), frame.height());
        let busiest = directions
            .iter()
            .filter(|(_, stats)| stats.count > 0)
            .fold(None, |best: Option<(Direction, u32)>, (direction, stats)| match best {
                Some((_, count)) if count >= stats.count => best,
                _ => Some((*direction, stats.count)),
            })
            .map(|(direction, _)| direction);

        let people = boxes.len() as u32;
        Ok(Evaluation::triggered(triggered).with_metadata(DetectionMetadata::Crowd(
            CrowdMetadata {
                people,
                cell_counts,
                directions,
                level: CrowdLevel::from_count(people),
                busiest,
            },
        )))
    }
}
