pub mod client_traffic;
pub mod inbound;
pub mod outbound_traffic;

pub use client_traffic::Entity as ClientTraffic;
pub use inbound::Entity as Inbound;
pub use inbound::Protocol;
pub use outbound_traffic::Entity as OutboundTraffic;
