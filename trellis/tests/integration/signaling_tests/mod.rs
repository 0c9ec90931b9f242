pub mod test_outbound_buffering;
