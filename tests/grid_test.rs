//! Grid index integration tests

use nephele::grid::GridIndex;
use proptest::prelude::*;

#[test]
fn test_max_boundary_clamps_into_last_cell() {
    let grid = GridIndex::new(8, -90.0, 90.0, -180.0, 180.0);
    assert_eq!(grid.locate(90.0, 180.0), Some("7_7".to_string()));
    assert_eq!(grid.locate(-90.0, -180.0), Some("0_0".to_string()));
}

#[test]
fn test_out_of_bounds_rejected() {
    let grid = GridIndex::new(4, 0.0, 10.0, 0.0, 10.0);
    assert_eq!(grid.locate(-1.0, 5.0), None);
    assert_eq!(grid.locate(5.0, 11.0), None);
    // world-box violations are rejected even with wide configured bounds
    let world = GridIndex::new(4, -90.0, 90.0, -180.0, 180.0);
    assert_eq!(world.locate(91.0, 0.0), None);
}

#[test]
fn test_insert_remove_round_trip() {
    let mut grid = GridIndex::new(4, 0.0, 10.0, 0.0, 10.0);
    assert!(grid.insert("n1", 2.0, 2.0));
    let cell = grid.locate(2.0, 2.0).unwrap();
    assert_eq!(grid.items_in(&cell), vec!["n1".to_string()]);

    assert!(grid.remove("n1", 2.0, 2.0));
    assert!(grid.items_in(&cell).is_empty());
    // removing again reports failure
    assert!(!grid.remove("n1", 2.0, 2.0));
}

proptest! {
    /// Every in-bounds coordinate lands in a valid cell, and an id inserted
    /// there is reachable both from its own cell and through the 3x3
    /// neighborhood of that cell.
    #[test]
    fn prop_locate_insert_neighbors_consistent(
        latitude in -90.0f64..=90.0,
        longitude in -180.0f64..=180.0,
        k in 1usize..=32,
    ) {
        let mut grid = GridIndex::new(k, -90.0, 90.0, -180.0, 180.0);
        let cell = grid.locate(latitude, longitude).expect("in-bounds coordinate must locate");

        let (lat_idx, lon_idx) = {
            let (lat, lon) = cell.split_once('_').unwrap();
            (lat.parse::<usize>().unwrap(), lon.parse::<usize>().unwrap())
        };
        prop_assert!(lat_idx < k);
        prop_assert!(lon_idx < k);

        prop_assert!(grid.insert("node", latitude, longitude));
        prop_assert!(grid.items_in(&cell).contains(&"node".to_string()));
        prop_assert!(grid.neighbors(&cell).contains(&"node".to_string()));
    }

    /// locate is stable: the same coordinate always maps to the same cell.
    #[test]
    fn prop_locate_deterministic(
        latitude in 0.0f64..=10.0,
        longitude in 0.0f64..=10.0,
    ) {
        let grid = GridIndex::new(16, 0.0, 10.0, 0.0, 10.0);
        prop_assert_eq!(grid.locate(latitude, longitude), grid.locate(latitude, longitude));
    }
}
