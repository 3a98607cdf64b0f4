//! Rectangular regions of interest in projected (EPSG:3031) metres.
use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box with a display name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub xmin: f64,
    pub xmax: f64,
    pub ymin: f64,
    pub ymax: f64,
}

impl Region {
    pub fn new(name: impl Into<String>, xmin: f64, xmax: f64, ymin: f64, ymax: f64) -> Self {
        Self {
            name: name.into(),
            xmin,
            xmax,
            ymin,
            ymax,
        }
    }

    /// Inclusive on all edges. `NaN` coordinates are never inside.
    #[inline]
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.xmin && x <= self.xmax && y >= self.ymin && y <= self.ymax
    }

    /// `[xmin, xmax, ymin, ymax]`.
    pub fn bounds(&self) -> [f64; 4] {
        [self.xmin, self.xmax, self.ymin, self.ymax]
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }
}

/// Named Antarctic regions, keyed by the short name used in run keys.
pub fn named_regions() -> Vec<(&'static str, Region)> {
    vec![
        (
            "kamb",
            Region::new(
                "Kamb Ice Stream",
                -411_054.192_405_234_44,
                -365_489.682_209_675_1,
                -739_741.770_226_185_9,
                -699_564.516_934_089,
            ),
        ),
        (
            "antarctica",
            Region::new("Antarctica", -2_700_000.0, 2_800_000.0, -2_200_000.0, 2_300_000.0),
        ),
        (
            "siple_coast",
            Region::new("Siple Coast", -1_000_000.0, 250_000.0, -1_000_000.0, -100_000.0),
        ),
        (
            "whillans",
            Region::new("Whillans Ice Stream", -350_000.0, -100_000.0, -700_000.0, -450_000.0),
        ),
        (
            "whillans2",
            Region::new("Whillans Ice Stream", -500_000.0, -400_000.0, -600_000.0, -500_000.0),
        ),
    ]
}

pub fn region_by_key(key: &str) -> Option<Region> {
    named_regions()
        .into_iter()
        .find(|(k, _)| *k == key)
        .map(|(_, r)| r)
}
