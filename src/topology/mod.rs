//! Topology Connector (C7): link selection between upstream/downstream/
//! sibling peers, layered on top of the Discovery Set and Transport Registry.

pub mod connector;
pub mod policy;

pub use connector::{ConnectPlan, ConnectionState, TopologyConnectionHandleData, TopologyConnector, TopologyRelation};
