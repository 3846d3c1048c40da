pub mod goodbye;
pub mod header;
pub mod packet;
pub mod picture_loss_indication;
pub mod receiver_estimated_maximum_bitrate;
pub mod receiver_report;
pub mod report_block;
pub mod sender_report;
pub mod source_description;
pub mod transport_layer_nack;

pub use goodbye::Goodbye;
pub use packet::{marshal_compound, parse_compound, RtcpPacket};
pub use picture_loss_indication::PictureLossIndication;
pub use receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
pub use receiver_report::ReceiverReport;
pub use report_block::{ReportBlock, SenderInfo};
pub use sender_report::SenderReport;
pub use source_description::SourceDescription;
pub use transport_layer_nack::{pack_nack_pairs, NackPair, TransportLayerNack};
