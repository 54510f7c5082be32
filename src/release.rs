use crate::errors::{AppError, AppResult};
use crate::models::{DeploymentRecord, EnvTarget, ProjectRef, ProviderKind};
use crate::providers::Provider;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReleaseAction {
    Promote,
    Rollback,
}

#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub dir: PathBuf,
    pub project: ProjectRef,
    pub alias: Option<String>,
    /// Deployment URL or provider reference; otherwise picked from history.
    pub reference: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSummary {
    pub ok: bool,
    pub provider: ProviderKind,
    pub action: ReleaseAction,
    pub target: EnvTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias_url: Option<String>,
    /// Rollback found a candidate but has no alias to repoint.
    pub needs_alias: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<String>,
}

/// Moves production aliases between existing deployments.
pub struct ReleaseManager {
    provider: Arc<dyn Provider>,
}

impl ReleaseManager {
    pub fn new(provider: Arc<dyn Provider>) -> AppResult<Self> {
        let caps = provider.capabilities();
        if !caps.alias_domains || !caps.rollback {
            return Err(AppError::Cli(format!(
                "{} cannot promote or roll back deployments",
                provider.kind().as_str()
            )));
        }
        Ok(Self { provider })
    }

    fn summary(&self, action: ReleaseAction) -> ReleaseSummary {
        ReleaseSummary {
            ok: false,
            provider: self.provider.kind(),
            action,
            target: EnvTarget::Production,
            from: None,
            alias_url: None,
            needs_alias: false,
            plan: Vec::new(),
        }
    }

    /// Points the production alias at a preview: the given one or the latest ready preview.
    pub async fn promote(&self, request: &ReleaseRequest) -> AppResult<ReleaseSummary> {
        let alias = request
            .alias
            .as_deref()
            .ok_or_else(|| AppError::Cli("promote needs --alias <domain>".to_string()))?;
        let mut summary = self.summary(ReleaseAction::Promote);

        if request.dry_run {
            summary.plan = vec![
                match &request.reference {
                    Some(reference) => format!("resolve deployment {}", reference),
                    None => "pick the latest ready preview deployment".to_string(),
                },
                format!("alias it to {}", alias),
            ];
            summary.ok = true;
            return Ok(summary);
        }

        let url = match &request.reference {
            Some(reference) => self.provider.resolve_deployment(&request.dir, reference).await?,
            None => {
                let history = self.provider.list_deployments(&request.dir, &request.project).await?;
                latest_preview(&history)
                    .ok_or_else(|| AppError::NotFound("no ready preview deployment to promote".to_string()))?
            }
        };
        info!(from = %url, alias, "promoting deployment");
        summary.alias_url = Some(self.provider.alias(&request.dir, &url, alias).await?);
        summary.from = Some(url);
        summary.ok = true;
        Ok(summary)
    }

    /// Points the production alias back at the previous production deployment.
    ///
    /// Without `--alias` the candidate is only reported.
    pub async fn rollback(&self, request: &ReleaseRequest) -> AppResult<ReleaseSummary> {
        if request.alias.is_none() && request.reference.is_none() {
            return Err(AppError::Cli(
                "rollback needs --alias <domain> and/or --to <deployment>".to_string(),
            ));
        }
        let mut summary = self.summary(ReleaseAction::Rollback);

        if request.dry_run {
            summary.plan.push(match &request.reference {
                Some(reference) => format!("resolve deployment {}", reference),
                None => "pick the previous ready production deployment".to_string(),
            });
            if let Some(alias) = &request.alias {
                summary.plan.push(format!("alias it to {}", alias));
            }
            summary.ok = true;
            return Ok(summary);
        }

        let url = match &request.reference {
            Some(reference) => self.provider.resolve_deployment(&request.dir, reference).await?,
            None => {
                let history = self.provider.list_deployments(&request.dir, &request.project).await?;
                previous_production(&history)
                    .ok_or_else(|| AppError::NotFound("no previous production deployment found".to_string()))?
            }
        };
        summary.from = Some(url.clone());

        let Some(alias) = &request.alias else {
            summary.needs_alias = true;
            summary.ok = true;
            return Ok(summary);
        };
        info!(to = %url, alias = %alias, "rolling back production alias");
        summary.alias_url = Some(self.provider.alias(&request.dir, &url, alias).await?);
        summary.ok = true;
        Ok(summary)
    }
}

fn latest_preview(history: &[DeploymentRecord]) -> Option<String> {
    history
        .iter()
        .find(|record| record.ready && record.target != EnvTarget::Production)
        .map(|record| record.url.clone())
}

/// Second-newest ready production deployment, or the only one.
fn previous_production(history: &[DeploymentRecord]) -> Option<String> {
    let ready: Vec<&DeploymentRecord> = history
        .iter()
        .filter(|record| record.ready && record.target == EnvTarget::Production)
        .collect();
    ready.get(1).or_else(|| ready.first()).map(|record| record.url.clone())
}
