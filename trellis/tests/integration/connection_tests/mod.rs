pub mod test_candidate_gating;
pub mod test_close_idempotent;
pub mod test_incoming_media;
pub mod test_signal_envelopes;
