//! Topic names and filter matching.
//!
//! Every topic the agents publish to or subscribe on is built here, so the
//! device side of the cloud API lives in one place.

/// Hierarchical filter match with `+` (one level) and `#` (all remaining
/// levels, including none).  Filters that start with a wildcard never
/// match topics beginning with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if filter.is_empty() || topic.is_empty() {
        return false;
    }
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    while let Some(f) = filter_levels.next() {
        match f {
            // Only valid as the final level.
            "#" => return filter_levels.peek().is_none(),
            "+" => {
                if topic_levels.next().is_none() {
                    return false;
                }
            }
            level => match topic_levels.next() {
                Some(t) if t == level => {}
                _ => return false,
            },
        }
    }
    topic_levels.next().is_none()
}

// ── Jobs ──────────────────────────────────────────────────────

pub fn jobs_notify_next(thing: &str) -> String {
    format!("$aws/things/{thing}/jobs/notify-next")
}

/// Ask for the next pending job; the answer uses the notify-next shape.
pub fn jobs_next_get(thing: &str) -> String {
    format!("$aws/things/{thing}/jobs/$next/get")
}

pub fn jobs_next_get_accepted(thing: &str) -> String {
    format!("$aws/things/{thing}/jobs/$next/get/accepted")
}

pub fn job_update(thing: &str, job_id: &str) -> String {
    format!("$aws/things/{thing}/jobs/{job_id}/update")
}

/// Is `topic` the broker's response to our own status update for `job_id`?
pub fn is_job_update_response(topic: &str, thing: &str, job_id: &str) -> bool {
    let base = job_update(thing, job_id);
    topic
        .strip_prefix(base.as_str())
        .is_some_and(|rest| rest == "/accepted" || rest == "/rejected")
}

// ── Streams ───────────────────────────────────────────────────

pub fn stream_get(thing: &str, stream: &str) -> String {
    format!("$aws/things/{thing}/streams/{stream}/get/json")
}

pub fn stream_data(thing: &str, stream: &str) -> String {
    format!("$aws/things/{thing}/streams/{stream}/data/json")
}

// ── Certificates ──────────────────────────────────────────────

pub fn csr_create(thing: &str) -> String {
    format!("things/{thing}/certificate/create-from-csr/json")
}

pub fn csr_accepted(thing: &str) -> String {
    format!("{}/accepted", csr_create(thing))
}

pub fn csr_rejected(thing: &str) -> String {
    format!("{}/rejected", csr_create(thing))
}

pub fn cert_revoke(thing: &str) -> String {
    format!("things/{thing}/certificate/revoke/json")
}

pub fn revoke_accepted(thing: &str) -> String {
    format!("{}/accepted", cert_revoke(thing))
}

pub fn revoke_rejected(thing: &str) -> String {
    format!("{}/rejected", cert_revoke(thing))
}

// ── Fleet provisioning ────────────────────────────────────────

/// Certificate issued against the claim identity.  Not per-thing: the
/// device has no thing name yet.
pub const FLEET_CSR_CREATE: &str = "$aws/certificates/create-from-csr/json";

pub fn fleet_csr_accepted() -> String {
    format!("{FLEET_CSR_CREATE}/accepted")
}

pub fn fleet_csr_rejected() -> String {
    format!("{FLEET_CSR_CREATE}/rejected")
}

pub fn fleet_register(template: &str) -> String {
    format!("$aws/provisioning-templates/{template}/provision/json")
}

pub fn fleet_register_accepted(template: &str) -> String {
    format!("{}/accepted", fleet_register(template))
}

pub fn fleet_register_rejected(template: &str) -> String {
    format!("{}/rejected", fleet_register(template))
}

/// Response topics end in `/accepted` or `/rejected`.
pub fn is_accepted(topic: &str) -> bool {
    topic.ends_with("/accepted")
}
