use crate::errors::{ErrorCode, ProviderError};
use crate::executor::output::tail_lines;
use crate::executor::{CommandResult, FailureReason};
use crate::models::ProviderKind;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

const DETAIL_LINES: usize = 40;
const MAX_MESSAGE_CHARS: usize = 2_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remedy: Option<String>,
}

struct Predicate {
    code: ErrorCode,
    pattern: Regex,
    message: &'static str,
}

fn predicate(code: ErrorCode, pattern: &str, message: &'static str) -> Predicate {
    Predicate {
        code,
        pattern: Regex::new(&format!("(?i){}", pattern)).expect("valid classifier regex"),
        message,
    }
}

// Evaluated top to bottom; first match wins.
static PREDICATES: Lazy<Vec<Predicate>> = Lazy::new(|| {
    vec![
        predicate(
            ErrorCode::AuthRequired,
            r"not logged in|please run:? `?\w+ login|you must be logged in|not authenticated|authentication required|no existing credentials",
            "You are not logged in to the provider CLI.",
        ),
        predicate(
            ErrorCode::AuthExpired,
            r"unauthorized|token (has )?expired|status code 401|invalid token",
            "Provider authentication expired or is unauthorized.",
        ),
        predicate(
            ErrorCode::NotLinked,
            r"not linked|don't appear to be in a folder that is linked|project not linked",
            "The current directory is not linked to a provider project.",
        ),
        predicate(
            ErrorCode::InvalidProjectOrOrg,
            r"invalid project id|project not found|team not found|org not found|scope not found",
            "Invalid or unknown provider project, org or team.",
        ),
        predicate(
            ErrorCode::BuildFailed,
            r#"build failed|failed to compile|command "vercel build"|error during build|build script returned non-zero"#,
            "The build failed.",
        ),
        predicate(
            ErrorCode::LintOrTypeCheckFailed,
            r"eslint|type error|typescript error",
            "Build failed due to lint or type-check errors.",
        ),
        predicate(
            ErrorCode::EnvMissing,
            r"missing environment|not defined in process\.env|undefined environment variable|env var.*missing",
            "A required environment variable appears to be missing.",
        ),
        predicate(
            ErrorCode::ModuleNotFound,
            r"module_not_found|cannot find module",
            "A required package or module could not be resolved during build.",
        ),
        predicate(
            ErrorCode::PermissionDenied,
            r"permission denied|access denied|eacces",
            "Permission denied during an operation.",
        ),
        predicate(
            ErrorCode::NetworkError,
            r"network|etimedout|econnreset|econnrefused|enotfound",
            "A network error occurred during the operation.",
        ),
    ]
});

fn login_command(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::Vercel => "vercel login",
        ProviderKind::Cloudflare => "wrangler login",
        ProviderKind::GithubPages => "gh auth login",
        ProviderKind::Noop => "launchpad up noop",
    }
}

fn remedy_for(code: ErrorCode, provider: ProviderKind) -> Option<String> {
    let remedy = match code {
        ErrorCode::AuthRequired => format!("Run: {}", login_command(provider)),
        ErrorCode::AuthExpired => format!(
            "Run: {} (or provide an access token in CI)",
            login_command(provider)
        ),
        ErrorCode::NotLinked => match provider {
            ProviderKind::Vercel => "Run: vercel link (or pass --project/--org in CI)".to_string(),
            _ => "Link the directory to a provider project (or pass --project)".to_string(),
        },
        ErrorCode::InvalidProjectOrOrg => {
            "Verify the project and org identifiers (--project/--org) or re-link the directory".to_string()
        }
        ErrorCode::BuildFailed => {
            "Run the build locally and compare required env with `launchpad env diff`".to_string()
        }
        ErrorCode::LintOrTypeCheckFailed => "Fix the reported lint and type errors".to_string(),
        ErrorCode::EnvMissing => {
            "Compare with `launchpad env diff`, then apply with `launchpad env sync`".to_string()
        }
        ErrorCode::ModuleNotFound => {
            "Reinstall dependencies and check the Node version in use".to_string()
        }
        ErrorCode::PermissionDenied => "Check file permissions and provider access rights".to_string(),
        ErrorCode::NetworkError => {
            "Retry the command; if it persists check connectivity or provider status".to_string()
        }
        ErrorCode::Timeout => "Raise the timeout with --timeout-ms or check for a hung prompt".to_string(),
        ErrorCode::IdleTimeout => {
            "The command stopped producing output; it may be waiting for input".to_string()
        }
        ErrorCode::UnknownProviderError => return None,
    };
    Some(remedy)
}

/// Maps raw failure output to a taxonomy code, message and remedy.
pub fn classify(provider: ProviderKind, raw: &str) -> Classification {
    for candidate in PREDICATES.iter() {
        if candidate.pattern.is_match(raw) {
            return Classification {
                code: candidate.code,
                message: candidate.message.to_string(),
                remedy: remedy_for(candidate.code, provider),
            };
        }
    }

    let trimmed = raw.trim();
    let message = if trimmed.is_empty() {
        "Unknown provider error.".to_string()
    } else {
        trimmed.chars().take(MAX_MESSAGE_CHARS).collect()
    };
    Classification {
        code: ErrorCode::UnknownProviderError,
        message,
        remedy: None,
    }
}

/// Builds a provider error for a failed invocation, honoring executor failure reasons first.
pub fn classify_result(provider: ProviderKind, result: &CommandResult) -> ProviderError {
    let combined = result.combined_output();
    let classification = match result.reason {
        Some(FailureReason::TimedOut) => Classification {
            code: ErrorCode::Timeout,
            message: "The provider command timed out.".to_string(),
            remedy: remedy_for(ErrorCode::Timeout, provider),
        },
        Some(FailureReason::IdleTimeout) => Classification {
            code: ErrorCode::IdleTimeout,
            message: "The provider command produced no output before the idle timeout.".to_string(),
            remedy: remedy_for(ErrorCode::IdleTimeout, provider),
        },
        _ => classify(provider, &combined),
    };

    let mut error = ProviderError::new(classification.code, provider.as_str(), classification.message)
        .with_detail(tail_lines(&combined, DETAIL_LINES));
    error.remedy = classification.remedy;
    error
}
