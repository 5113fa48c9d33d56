//! Key conventions shared by every store implementation.

/// Secondary index over `(index_status, index_deadline)`.
pub const ESCALATION_INDEX: &str = "EscalationIndex";

pub const CHECKIN_PREFIX: &str = "checkin:";
pub const CONTACT_PREFIX: &str = "contact:";

pub fn user_partition_key(user_id: &str) -> String {
    format!("user:{user_id}")
}

pub fn checkin_sort_key(check_in_id: &str) -> String {
    format!("{CHECKIN_PREFIX}{check_in_id}")
}

pub fn contact_sort_key(contact_id: &str) -> String {
    format!("{CONTACT_PREFIX}{contact_id}")
}
