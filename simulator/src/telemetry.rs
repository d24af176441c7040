use rand::Rng;

/// Produces successive value rows for a device with the given columns.
///
/// When the device reports both `lat` and `lon`, those columns follow a
/// random walk so the track on the map looks like something moving.
#[derive(Debug, Clone)]
pub struct Generator {
    columns: Vec<String>,
    position: Option<Position>,
}

#[derive(Debug, Clone, Copy)]
struct Position {
    lat_idx: usize,
    lon_idx: usize,
    lat: f64,
    lon: f64,
}

// About 50 m per step at mid latitudes
const WALK_STEP_DEG: f64 = 0.0005;

impl Generator {
    pub fn new(columns: Vec<String>, start: (f64, f64)) -> Self {
        let lat_idx = columns.iter().position(|c| c == "lat");
        let lon_idx = columns.iter().position(|c| c == "lon");
        let position = lat_idx.zip(lon_idx).map(|(lat_idx, lon_idx)| Position {
            lat_idx,
            lon_idx,
            lat: start.0,
            lon: start.1,
        });
        Self { columns, position }
    }

    pub fn next_row(&mut self, rng: &mut impl Rng) -> Vec<f64> {
        let mut row: Vec<f64> = self
            .columns
            .iter()
            .map(|column| sample(rng, column))
            .collect();

        if let Some(pos) = self.position.as_mut() {
            pos.lat = (pos.lat + rng.gen_range(-WALK_STEP_DEG..WALK_STEP_DEG)).clamp(-90.0, 90.0);
            pos.lon = wrap_longitude(pos.lon + rng.gen_range(-WALK_STEP_DEG..WALK_STEP_DEG));
            row[pos.lat_idx] = pos.lat;
            row[pos.lon_idx] = pos.lon;
        }
        row
    }
}

fn sample(rng: &mut impl Rng, column: &str) -> f64 {
    let value = match column {
        "temp" | "temperature" => {
            if rng.gen_bool(0.05) {
                rng.gen_range(-50.0..100.0) // 5% outliers
            } else {
                rng.gen_range(15.0..35.0)
            }
        }
        "humidity" => rng.gen_range(30.0..80.0),
        "battery" => {
            if rng.gen_bool(0.02) {
                rng.gen_range(0.0..20.0) // 2% low battery
            } else {
                rng.gen_range(20.0..100.0)
            }
        }
        "pressure" => rng.gen_range(980.0..1040.0),
        _ => rng.gen_range(0.0..100.0),
    };
    (value * 100.0_f64).round() / 100.0
}

fn wrap_longitude(lon: f64) -> f64 {
    if lon > 180.0 {
        lon - 360.0
    } else if lon < -180.0 {
        lon + 360.0
    } else {
        lon
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_row_matches_columns() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut gen = Generator::new(columns(&["temp", "humidity", "battery"]), (0.0, 0.0));
        for _ in 0..100 {
            let row = gen.next_row(&mut rng);
            assert_eq!(row.len(), 3);
            assert!((30.0..=80.0).contains(&row[1]));
        }
    }

    #[test]
    fn test_position_walks() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut gen = Generator::new(columns(&["lat", "speed", "lon"]), (52.23, 21.01));
        let mut prev = (52.23, 21.01);
        for _ in 0..50 {
            let row = gen.next_row(&mut rng);
            assert!((row[0] - prev.0).abs() <= WALK_STEP_DEG + 1e-12);
            assert!((row[2] - prev.1).abs() <= WALK_STEP_DEG + 1e-12);
            prev = (row[0], row[2]);
        }
    }

    #[test]
    fn test_wrap_longitude() {
        assert_eq!(wrap_longitude(181.0), -179.0);
        assert_eq!(wrap_longitude(-181.0), 179.0);
        assert_eq!(wrap_longitude(12.5), 12.5);
    }
}
