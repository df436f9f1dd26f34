pub mod ack;
pub mod fragment;
pub mod recv_buffer;
pub mod reliability;
pub mod rtt;
pub mod send_buffer;

pub use ack::Ack;
pub use fragment::{DatagramClass, Fragment, FragmentFlags};
pub use recv_buffer::UdpReceiveBuffer;
pub use reliability::{InboundEvent, OutboundDatagram, UdpReliabilityLayer};
pub use rtt::RttEstimator;
pub use send_buffer::UdpSendBuffer;
