//! Builders for every topic the bridge publishes on.
//!
//! Inbound topics are matched by the server's route table; these helpers
//! only cover the outbound side so both ends agree on the grammar.

pub fn ambulance_data(ambulance_id: i64) -> String {
    format!("ambulance/{ambulance_id}/data")
}

pub fn ambulance_call_status(ambulance_id: i64, call_id: i64) -> String {
    format!("ambulance/{ambulance_id}/call/{call_id}/status")
}

pub fn hospital_data(hospital_id: i64) -> String {
    format!("hospital/{hospital_id}/data")
}

pub fn hospital_metadata(hospital_id: i64) -> String {
    format!("hospital/{hospital_id}/metadata")
}

pub fn equipment_item_data(holder_id: i64, equipment_id: i64) -> String {
    format!("equipment/{holder_id}/item/{equipment_id}/data")
}

pub fn call_data(call_id: i64) -> String {
    format!("call/{call_id}/data")
}

pub fn user_profile(username: &str) -> String {
    format!("user/{username}/profile")
}

/// Private error topic of one device session.
pub fn client_error(username: &str, client_id: &str) -> String {
    format!("user/{username}/client/{client_id}/error")
}

/// Presence topic of one device session; also the last-will topic.
pub fn client_status(username: &str, client_id: &str) -> String {
    format!("user/{username}/client/{client_id}/status")
}
