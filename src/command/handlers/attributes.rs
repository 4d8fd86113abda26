//! Routing of job output into subscriber attributes

use super::HandlerContext;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Fields of the subscriber resource set by a job type
pub fn attribute_fields(job_type: &str, value: &str) -> Option<BTreeMap<&'static str, String>> {
    let keys: &[&'static str] = match job_type {
        "update_ep" => &["ghn_ep_mac"],
        "update_dm" => &["ghn_dm_mac"],
        "update_min_rate" => &["lq_min_rate"],
        "update_max_rate" => &["lq_max_rate", "lq_current_rate"],
        _ => return None,
    };
    Some(keys.iter().map(|key| (*key, value.to_string())).collect())
}

/// Send the job output to `vbuser_id` if the job type maps to attributes
pub async fn update_vbuser(ctx: &HandlerContext, vbuser_id: &str, job_type: &str, output: &str) {
    let Some(fields) = attribute_fields(job_type, output) else {
        debug!("Job type {:?} carries no vbuser attributes", job_type);
        return;
    };

    info!("Vbuser id: {}; job type: {}", vbuser_id, job_type);
    if let Err(e) = ctx.client.patch_vbuser(vbuser_id, &fields).await {
        info!("Error updating vbuser: {:#}", e);
    }
}
