/// Geographic → projected coordinate transforms.
/// All coordinate math uses f64.
use serde::{Deserialize, Serialize};

/// WGS84 semi-major axis (m).
const WGS84_A: f64 = 6_378_137.0;
/// WGS84 first eccentricity.
const WGS84_E: f64 = 0.081_819_190_842_621_5;
/// EPSG:3031 latitude of true scale, degrees south.
const TRUE_SCALE_LAT_S: f64 = 71.0;

/// Supported target projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Projection {
    /// Antarctic Polar Stereographic (EPSG:3031).
    #[default]
    PolarStereographicSouth,
}

impl Projection {
    /// Project (longitude, latitude) in degrees to (x, y) in metres.
    /// Non-finite input yields `(NaN, NaN)`.
    pub fn lonlat_to_xy(self, lon: f64, lat: f64) -> (f64, f64) {
        if !lon.is_finite() || !lat.is_finite() {
            return (f64::NAN, f64::NAN);
        }
        match self {
            Projection::PolarStereographicSouth => polar_stereographic_south(lon, lat),
        }
    }
}

/// Snyder (1987) ellipsoidal polar stereographic, south aspect, central
/// meridian 0°. Worked in the mirrored north aspect then flipped back.
fn polar_stereographic_south(lon: f64, lat: f64) -> (f64, f64) {
    let phi = (-lat).to_radians();
    let lam = (-lon).to_radians();
    let phi_c = TRUE_SCALE_LAT_S.to_radians();

    let t = iso_t(phi);
    let t_c = iso_t(phi_c);
    let m_c = phi_c.cos() / (1.0 - (WGS84_E * phi_c.sin()).powi(2)).sqrt();
    let rho = WGS84_A * m_c * t / t_c;

    let x = rho * lam.sin();
    let y = -rho * lam.cos();
    (-x, -y)
}

fn iso_t(phi: f64) -> f64 {
    let es = WGS84_E * phi.sin();
    (std::f64::consts::FRAC_PI_4 - phi / 2.0).tan() / ((1.0 - es) / (1.0 + es)).powf(WGS84_E / 2.0)
}
