pub mod test_busy_channel;
pub mod test_chunked_roundtrip;
pub mod test_send_before_open;
pub mod test_serialization_modes;
