//! Geospatial grid index for proximity lookups
//!
//! Partitions a bounding lat/long rectangle into a k x k cell grid and maps
//! entity ids to cells by coordinate. Lookups are O(1): an exact cell fetch
//! or the union of the 3x3 neighborhood around a cell. The cell size is
//! fixed; there is no recursive refinement.

use std::collections::{HashMap, HashSet};

// ============================================================================
// Grid Index
// ============================================================================

/// Fixed-resolution geospatial index over a bounding rectangle.
///
/// Cell ids have the form `"<latIdx>_<lonIdx>"` with both indices in
/// `[0, k)`. An id lives in at most one cell at a time; callers must pass
/// the same coordinates to `remove` that they passed to `insert`.
#[derive(Debug)]
pub struct GridIndex {
    k: usize,
    min_latitude: f64,
    max_latitude: f64,
    min_longitude: f64,
    max_longitude: f64,
    cells: HashMap<String, HashSet<String>>,
}

impl GridIndex {
    /// Create a grid with `k` cells per axis over the given rectangle.
    pub fn new(k: usize, min_latitude: f64, max_latitude: f64, min_longitude: f64, max_longitude: f64) -> Self {
        let mut cells = HashMap::with_capacity(k * k);
        for i in 0..k {
            for j in 0..k {
                cells.insert(format!("{i}_{j}"), HashSet::new());
            }
        }

        Self {
            k,
            min_latitude,
            max_latitude,
            min_longitude,
            max_longitude,
            cells,
        }
    }

    /// Grid resolution per axis.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Check that a coordinate lies inside both the world box and the
    /// configured bounding rectangle.
    pub fn valid_coordinate(&self, latitude: f64, longitude: f64) -> bool {
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return false;
        }
        latitude >= self.min_latitude
            && latitude <= self.max_latitude
            && longitude >= self.min_longitude
            && longitude <= self.max_longitude
    }

    /// Map a coordinate to its cell id, or `None` if it is out of bounds.
    ///
    /// A coordinate exactly on `max_latitude`/`max_longitude` is clamped
    /// into the last cell (index `k - 1`), never index `k`.
    pub fn locate(&self, latitude: f64, longitude: f64) -> Option<String> {
        if !self.valid_coordinate(latitude, longitude) {
            return None;
        }

        let cell_height = (self.max_latitude - self.min_latitude) / self.k as f64;
        let cell_width = (self.max_longitude - self.min_longitude) / self.k as f64;

        let mut lat_idx = ((latitude - self.min_latitude) / cell_height).floor() as usize;
        let mut lon_idx = ((longitude - self.min_longitude) / cell_width).floor() as usize;

        if lat_idx >= self.k {
            lat_idx = self.k - 1;
        }
        if lon_idx >= self.k {
            lon_idx = self.k - 1;
        }

        Some(format!("{lat_idx}_{lon_idx}"))
    }

    /// Add an id to the cell covering the coordinate.
    ///
    /// Re-inserting an id already present in the cell is a no-op. Returns
    /// false if the coordinate is out of bounds.
    pub fn insert(&mut self, id: &str, latitude: f64, longitude: f64) -> bool {
        match self.locate(latitude, longitude) {
            Some(cell_id) => {
                if let Some(items) = self.cells.get_mut(&cell_id) {
                    items.insert(id.to_string());
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    /// Remove an id from the cell covering the coordinate.
    ///
    /// Returns false if the coordinate is out of bounds or the id was not
    /// in the computed cell.
    pub fn remove(&mut self, id: &str, latitude: f64, longitude: f64) -> bool {
        match self.locate(latitude, longitude) {
            Some(cell_id) => self
                .cells
                .get_mut(&cell_id)
                .map(|items| items.remove(id))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Ids currently in a cell. Unknown cell ids yield an empty set.
    pub fn items_in(&self, cell_id: &str) -> Vec<String> {
        self.cells
            .get(cell_id)
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Empty a single cell.
    pub fn clear(&mut self, cell_id: &str) {
        if let Some(items) = self.cells.get_mut(cell_id) {
            items.clear();
        }
    }

    /// Union of the 3x3 block of cells centered on `cell_id`, clipped at
    /// the grid edges. This is the "near me" primitive.
    pub fn neighbors(&self, cell_id: &str) -> Vec<String> {
        let Some((lat_idx, lon_idx)) = parse_cell_id(cell_id) else {
            return Vec::new();
        };

        let mut items = Vec::new();
        for lat in lat_idx.saturating_sub(1)..=lat_idx + 1 {
            if lat >= self.k {
                continue;
            }
            for lon in lon_idx.saturating_sub(1)..=lon_idx + 1 {
                if lon >= self.k {
                    continue;
                }
                if let Some(cell) = self.cells.get(&format!("{lat}_{lon}")) {
                    items.extend(cell.iter().cloned());
                }
            }
        }
        items
    }
}

/// Split a `"<latIdx>_<lonIdx>"` cell id into its indices.
fn parse_cell_id(cell_id: &str) -> Option<(usize, usize)> {
    let (lat, lon) = cell_id.split_once('_')?;
    Some((lat.parse().ok()?, lon.parse().ok()?))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn world_grid(k: usize) -> GridIndex {
        GridIndex::new(k, -90.0, 90.0, -180.0, 180.0)
    }

    #[test]
    fn test_locate_inside_bounds() {
        let grid = world_grid(4);
        // (10, 10) relative to (-90, -180): lat 100/45 -> 2, lon 190/90 -> 2
        assert_eq!(grid.locate(10.0, 10.0), Some("2_2".to_string()));
    }

    #[test]
    fn test_locate_outside_bounds() {
        let grid = GridIndex::new(4, 25.0, 49.0, -125.0, -65.0);
        assert_eq!(grid.locate(10.0, 10.0), None);
        assert_eq!(grid.locate(91.0, 0.0), None);
        assert_eq!(grid.locate(0.0, -181.0), None);
    }

    #[test]
    fn test_locate_clamps_upper_boundary() {
        let grid = world_grid(4);
        assert_eq!(grid.locate(90.0, 180.0), Some("3_3".to_string()));
        assert_eq!(grid.locate(90.0, 0.0), Some("3_2".to_string()));
        assert_eq!(grid.locate(0.0, 180.0), Some("2_3".to_string()));
    }

    #[test]
    fn test_insert_and_items_in() {
        let mut grid = world_grid(4);
        assert!(grid.insert("n1", 10.0, 10.0));
        assert_eq!(grid.items_in("2_2"), vec!["n1".to_string()]);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut grid = world_grid(4);
        assert!(grid.insert("n1", 10.0, 10.0));
        assert!(grid.insert("n1", 10.0, 10.0));
        assert_eq!(grid.items_in("2_2").len(), 1);
    }

    #[test]
    fn test_insert_out_of_bounds_fails() {
        let mut grid = GridIndex::new(4, 25.0, 49.0, -125.0, -65.0);
        assert!(!grid.insert("n1", 0.0, 0.0));
    }

    #[test]
    fn test_remove() {
        let mut grid = world_grid(4);
        grid.insert("n1", 10.0, 10.0);
        assert!(grid.remove("n1", 10.0, 10.0));
        assert!(grid.items_in("2_2").is_empty());
        // second removal finds nothing
        assert!(!grid.remove("n1", 10.0, 10.0));
    }

    #[test]
    fn test_remove_with_mismatched_coordinates() {
        let mut grid = world_grid(4);
        grid.insert("n1", 10.0, 10.0);
        // wrong cell: the id silently fails to be found
        assert!(!grid.remove("n1", -50.0, -50.0));
        assert_eq!(grid.items_in("2_2").len(), 1);
    }

    #[test]
    fn test_neighbors_center_cell() {
        let mut grid = world_grid(4);
        grid.insert("a", 10.0, 10.0); // 2_2
        grid.insert("b", 50.0, 10.0); // 3_2
        grid.insert("c", -50.0, -100.0); // 0_0, not adjacent to 2_2
        let near = grid.neighbors("2_2");
        assert!(near.contains(&"a".to_string()));
        assert!(near.contains(&"b".to_string()));
        assert!(!near.contains(&"c".to_string()));
    }

    #[test]
    fn test_neighbors_clipped_at_corner() {
        let mut grid = world_grid(4);
        grid.insert("corner", -89.0, -179.0); // 0_0
        grid.insert("adjacent", -50.0, -100.0); // 0_0? lat -50 -> idx 0? (-50+90)/45 = 0.88 -> 0; lon (-100+180)/90=0.88 -> 0
        let near = grid.neighbors("0_0");
        assert!(near.contains(&"corner".to_string()));
        // no panic or phantom cells past the edge
        assert!(grid.neighbors("3_3").is_empty());
    }

    #[test]
    fn test_neighbors_of_bad_cell_id() {
        let grid = world_grid(4);
        assert!(grid.neighbors("not-a-cell").is_empty());
    }

    #[test]
    fn test_clear() {
        let mut grid = world_grid(4);
        grid.insert("n1", 10.0, 10.0);
        grid.clear("2_2");
        assert!(grid.items_in("2_2").is_empty());
    }
}
