pub mod test_broadcast_rate_limit;
pub mod test_mesh_membership;
pub mod test_sfu_streams;
