pub mod traffic_log;

pub use traffic_log::Entity as TrafficLog;
