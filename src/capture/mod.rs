pub mod decoder;
pub mod frame;
pub mod http;
pub mod motion;

pub use decoder::{FrameDecoder, ImageStream, MultipartDecoder};
pub use frame::FrameEvent;
pub use http::{ByteStream, Connection, Connector, Credentials, HttpConnector};
pub use motion::{FrameStream, MotionConfig, MotionFilter, PixelDiffMotion};
