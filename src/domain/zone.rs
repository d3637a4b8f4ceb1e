//! Coverage zones (terminals) used for arrival detection

use serde::{Deserialize, Serialize};

/// A latitude/longitude pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    #[inline]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Named geofence: a marker point plus the boundary samples matched against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneDefinition {
    pub name: String,
    pub representative_point: Coordinate,
    pub boundary_points: Vec<Coordinate>,
}

impl ZoneDefinition {
    pub fn new(
        name: impl Into<String>,
        representative_point: Coordinate,
        boundary_points: Vec<Coordinate>,
    ) -> Self {
        Self { name: name.into(), representative_point, boundary_points }
    }
}

/// Terminal zones of the Cagayan de Oro deployment, in matching order
pub fn default_zones() -> Vec<ZoneDefinition> {
    vec![
        ZoneDefinition::new(
            "Canitoan",
            Coordinate::new(8.4663228, 124.5853069),
            vec![
                Coordinate::new(8.4663228, 124.5853069),
                Coordinate::new(8.4662452, 124.5852767),
                Coordinate::new(8.4661616, 124.5852413),
                Coordinate::new(8.466295, 124.585346),
                Coordinate::new(8.466283, 124.585379),
                Coordinate::new(8.4663551, 124.5853191),
                Coordinate::new(8.46645, 124.5853533),
                Coordinate::new(8.46654, 124.5853836),
                Coordinate::new(8.466279, 124.585378),
                Coordinate::new(8.4666278, 124.5854141),
                Coordinate::new(8.4666686, 124.5854298),
            ],
        ),
        ZoneDefinition::new(
            "Silver Creek",
            Coordinate::new(8.475946, 124.6120194),
            vec![
                Coordinate::new(8.475946, 124.6120194),
                Coordinate::new(8.475959, 124.6119225),
                Coordinate::new(8.4759729, 124.6118273),
                Coordinate::new(8.4759855, 124.6117332),
                Coordinate::new(8.475996, 124.6116395),
                Coordinate::new(8.4759068, 124.612282),
                Coordinate::new(8.4759231, 124.6121932),
                Coordinate::new(8.4759359, 124.612108),
                Coordinate::new(8.476007, 124.611547),
                Coordinate::new(8.475999, 124.6114423),
                Coordinate::new(8.4760076, 124.6113486),
                Coordinate::new(8.4760355, 124.6112278),
            ],
        ),
        ZoneDefinition::new(
            "Cogon",
            Coordinate::new(8.4758845, 124.650698),
            vec![
                Coordinate::new(8.4759746, 124.6507055),
                Coordinate::new(8.4760674, 124.6507123),
                Coordinate::new(8.4761608, 124.6507218),
                Coordinate::new(8.475870, 124.650668),
                Coordinate::new(8.475803, 124.650662),
                Coordinate::new(8.475654, 124.650639),
                Coordinate::new(8.475526, 124.650526),
                Coordinate::new(8.475603, 124.650023),
                Coordinate::new(8.475712, 124.650013),
                Coordinate::new(8.475821, 124.650023),
                Coordinate::new(8.476028, 124.650015),
                Coordinate::new(8.476889, 124.650006),
                Coordinate::new(8.4755573, 124.6494009),
                Coordinate::new(8.4755739, 124.6494997),
                Coordinate::new(8.475568, 124.649530),
                Coordinate::new(8.4756008, 124.6495459),
                Coordinate::new(8.4756387, 124.6495087),
                Coordinate::new(8.4757094, 124.6494624),
                Coordinate::new(8.4757819, 124.6494218),
                Coordinate::new(8.4758613, 124.6493788),
                Coordinate::new(8.4759719, 124.6493203),
                Coordinate::new(8.4760508, 124.6492765),
                Coordinate::new(8.4761418, 124.6492269),
                Coordinate::new(8.4762161, 124.6491886),
                Coordinate::new(8.4762967, 124.6491424),
                Coordinate::new(8.4763816, 124.6490997),
                Coordinate::new(8.477661, 124.648576),
                Coordinate::new(8.4776936, 124.648487),
                Coordinate::new(8.4777268, 124.6483193),
                Coordinate::new(8.4776042, 124.6487722),
                Coordinate::new(8.477585, 124.6488584),
                Coordinate::new(8.4755825, 124.6497299),
                Coordinate::new(8.475565, 124.6499231),
                Coordinate::new(8.4755559, 124.6500217),
                Coordinate::new(8.4755522, 124.6500687),
            ],
        ),
    ]
}
