use kube::{api::ListParams, Api};

use super::{Action, Error, ReconcilerContext};
use crate::{
    platform,
    types::{
        self,
        acp::{AccessControlPolicy, AccessControlPolicyStatus},
    },
    util::with_timeout,
};

/// The AccessControlPolicy mirroring a platform policy.
pub fn desired(acp: &platform::Acp) -> Result<AccessControlPolicy, serde_json::Error> {
    let mut policy = AccessControlPolicy::new(&acp.name, acp.spec.clone());
    policy.metadata.namespace = Some(acp.namespace.clone());
    policy.metadata.labels = Some(types::managed_labels());
    policy.status = Some(AccessControlPolicyStatus {
        version: Some(acp.version.clone()),
        spec_hash: Some(platform::spec_hash(&acp.spec)?),
    });
    Ok(policy)
}

fn up_to_date(existing: &AccessControlPolicy, desired: &AccessControlPolicy) -> bool {
    let version = |policy: &AccessControlPolicy| {
        policy
            .status
            .as_ref()
            .and_then(|status| status.version.clone())
    };
    existing.spec == desired.spec && version(existing) == version(desired)
}

pub fn plan(
    acps: &[platform::Acp],
    existing: &[AccessControlPolicy],
) -> Result<Vec<Action<AccessControlPolicy>>, serde_json::Error> {
    let desired = acps.iter().map(desired).collect::<Result<Vec<_>, _>>()?;
    Ok(super::plan(desired, existing, up_to_date))
}

/// Converges the AccessControlPolicies of the cluster to the ones of the platform.
pub async fn reconcile(ctx: &ReconcilerContext) -> Result<(), Error> {
    let acps = ctx.platform.get_acps().await?;
    let api = Api::<AccessControlPolicy>::all(ctx.client.clone());
    let existing = with_timeout(api.list(&ListParams::default())).await?.items;

    let actions = plan(&acps, &existing).map_err(Error::Serialize)?;
    tracing::debug!(policies = acps.len(), actions = actions.len(), "reconciling AccessControlPolicies");
    for action in actions {
        if let Err(error) = super::apply(&ctx.client, action).await {
            tracing::error!(%error, "failed to reconcile AccessControlPolicy");
        }
    }
    Ok(())
}
