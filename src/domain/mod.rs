// Domain layer: card models and the ports the pipeline drives.

pub mod model;
pub mod ports;
