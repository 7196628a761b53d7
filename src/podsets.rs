use serde_json::Value;
use thiserror::Error;

use crate::crd::{AppWrapperComponent, AppWrapperPodSet};

/* ============================= ERRORS ============================= */

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("pod set path must begin with 'template', got '{0}'")]
    BadRoot(String),

    #[error("invalid path syntax after '{processed}'")]
    Syntax { processed: String },

    #[error("field '{field}' not found after '{processed}'")]
    MissingField { processed: String, field: String },

    #[error("index {index} out of range after '{processed}'")]
    OutOfRange { processed: String, index: usize },

    #[error("expected a map at '{processed}'")]
    NotAMap { processed: String },

    #[error("expected an integer at '{processed}'")]
    NotAnInt { processed: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PodSetError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("template is missing apiVersion or kind")]
    MissingTypeMeta,

    #[error("duplicate pod set path '{0}'")]
    DuplicatePath(String),

    #[error("declared {declared} pod sets but inferred {inferred}")]
    CountMismatch { declared: usize, inferred: usize },

    #[error("declared pod set '{0}' does not match any inferred pod set")]
    UnmatchedPath(String),

    #[error("pod set '{path}' declares {declared} replicas but template implies {inferred}")]
    ReplicaMismatch {
        path: String,
        declared: i32,
        inferred: i32,
    },

    #[error("path '{0}' does not resolve to a pod template spec")]
    NotAPodTemplate(String),
}

/* ============================= PATH INTERPRETER ============================= */

// Grammar: `template (.field | [int])*`. The interpreter keeps the processed
// prefix so errors point at the exact failing segment.

enum Segment {
    Field(String),
    Index(usize),
}

fn parse_segments(path: &str) -> Result<Vec<Segment>, PathError> {
    let rest = path
        .strip_prefix("template")
        .ok_or_else(|| PathError::BadRoot(path.to_string()))?;

    let mut segments = Vec::new();
    let mut chars = rest.char_indices().peekable();
    let processed = |idx: usize| format!("template{}", &rest[..idx]);

    while let Some((idx, c)) = chars.next() {
        match c {
            '.' => {
                let mut field = String::new();
                while let Some((_, c)) = chars.peek() {
                    if *c == '.' || *c == '[' {
                        break;
                    }
                    field.push(*c);
                    chars.next();
                }
                if field.is_empty() {
                    return Err(PathError::Syntax {
                        processed: processed(idx),
                    });
                }
                segments.push(Segment::Field(field));
            }
            '[' => {
                let mut digits = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == ']' {
                        closed = true;
                        break;
                    }
                    digits.push(c);
                }
                let index = digits.parse().ok();
                match (closed, index) {
                    (true, Some(i)) => segments.push(Segment::Index(i)),
                    _ => {
                        return Err(PathError::Syntax {
                            processed: processed(idx),
                        });
                    }
                }
            }
            _ => {
                return Err(PathError::Syntax {
                    processed: processed(idx),
                });
            }
        }
    }

    Ok(segments)
}

/// Resolve `path` against a component template (the value at `template`).
pub fn resolve_path<'a>(template: &'a Value, path: &str) -> Result<&'a Value, PathError> {
    let segments = parse_segments(path)?;
    let mut current = template;
    let mut processed = String::from("template");

    for segment in segments {
        match segment {
            Segment::Field(field) => {
                current = current
                    .as_object()
                    .ok_or_else(|| PathError::NotAMap {
                        processed: processed.clone(),
                    })?
                    .get(&field)
                    .ok_or_else(|| PathError::MissingField {
                        processed: processed.clone(),
                        field: field.clone(),
                    })?;
                processed.push('.');
                processed.push_str(&field);
            }
            Segment::Index(index) => {
                let items = current.as_array().ok_or_else(|| PathError::NotAMap {
                    processed: processed.clone(),
                })?;
                current = items.get(index).ok_or_else(|| PathError::OutOfRange {
                    processed: processed.clone(),
                    index,
                })?;
                processed.push_str(&format!("[{index}]"));
            }
        }
    }

    Ok(current)
}

/// Mutable variant of [`resolve_path`], used by injection.
pub fn resolve_path_mut<'a>(
    template: &'a mut Value,
    path: &str,
) -> Result<&'a mut Value, PathError> {
    let segments = parse_segments(path)?;
    let mut current = template;
    let mut processed = String::from("template");

    for segment in segments {
        match segment {
            Segment::Field(field) => {
                current = match current.as_object_mut() {
                    Some(map) => map.get_mut(&field).ok_or_else(|| PathError::MissingField {
                        processed: processed.clone(),
                        field: field.clone(),
                    })?,
                    None => {
                        return Err(PathError::NotAMap {
                            processed: processed.clone(),
                        });
                    }
                };
                processed.push('.');
                processed.push_str(&field);
            }
            Segment::Index(index) => {
                current = match current.as_array_mut() {
                    Some(items) => items.get_mut(index).ok_or_else(|| PathError::OutOfRange {
                        processed: processed.clone(),
                        index,
                    })?,
                    None => {
                        return Err(PathError::NotAMap {
                            processed: processed.clone(),
                        });
                    }
                };
                processed.push_str(&format!("[{index}]"));
            }
        }
    }

    Ok(current)
}

/// Resolve a path and require a map value.
pub fn resolve_map<'a>(
    template: &'a Value,
    path: &str,
) -> Result<&'a serde_json::Map<String, Value>, PathError> {
    resolve_path(template, path)?
        .as_object()
        .ok_or_else(|| PathError::NotAMap {
            processed: path.to_string(),
        })
}

/// Resolve a path and require an integer value.
pub fn resolve_int(template: &Value, path: &str) -> Result<i64, PathError> {
    resolve_path(template, path)?
        .as_i64()
        .ok_or_else(|| PathError::NotAnInt {
            processed: path.to_string(),
        })
}

/* ============================= TYPE META ============================= */

/// `(api_version, kind)` of a template, or the fatal type-meta error.
pub fn template_type_meta(template: &Value) -> Result<(String, String), PodSetError> {
    let api_version = template["apiVersion"].as_str();
    let kind = template["kind"].as_str();
    match (api_version, kind) {
        (Some(a), Some(k)) if !a.is_empty() && !k.is_empty() => {
            Ok((a.to_string(), k.to_string()))
        }
        _ => Err(PodSetError::MissingTypeMeta),
    }
}

/* ============================= INFERENCE ============================= */

fn int_or(template: &Value, path: &str, default: i64) -> i64 {
    resolve_int(template, path).unwrap_or(default)
}

/// Infer the pod sets a known kind will produce; `None` for unknown kinds
/// (their declared pod sets stand on their own).
pub fn infer_pod_sets(template: &Value) -> Result<Option<Vec<AppWrapperPodSet>>, PodSetError> {
    let (api_version, kind) = template_type_meta(template)?;

    let sets = match (api_version.as_str(), kind.as_str()) {
        ("v1", "Pod") => vec![AppWrapperPodSet::new("template", Some(1))],

        ("batch/v1", "Job") => {
            let parallelism = int_or(template, "template.spec.parallelism", 1);
            let completions = int_or(template, "template.spec.completions", parallelism);
            vec![AppWrapperPodSet::new(
                "template.spec.template",
                Some(parallelism.min(completions) as i32),
            )]
        }

        ("apps/v1", "Deployment" | "StatefulSet") => {
            let replicas = int_or(template, "template.spec.replicas", 1);
            vec![AppWrapperPodSet::new(
                "template.spec.template",
                Some(replicas as i32),
            )]
        }

        ("kubeflow.org/v1", "PyTorchJob") => {
            let mut sets = Vec::new();
            for role in ["Master", "Worker"] {
                let base = format!("template.spec.pytorchReplicaSpecs.{role}");
                if resolve_path(template, &base).is_ok() {
                    let replicas = int_or(template, &format!("{base}.replicas"), 1);
                    sets.push(AppWrapperPodSet::new(
                        &format!("{base}.template"),
                        Some(replicas as i32),
                    ));
                }
            }
            sets
        }

        ("ray.io/v1", "RayCluster") => ray_cluster_pod_sets(template, "template.spec")?,

        ("ray.io/v1", "RayJob") => {
            ray_cluster_pod_sets(template, "template.spec.rayClusterSpec")?
        }

        _ => return Ok(None),
    };

    Ok(Some(sets))
}

fn ray_cluster_pod_sets(
    template: &Value,
    spec_path: &str,
) -> Result<Vec<AppWrapperPodSet>, PodSetError> {
    let mut sets = vec![AppWrapperPodSet::new(
        &format!("{spec_path}.headGroupSpec.template"),
        Some(1),
    )];

    let groups_path = format!("{spec_path}.workerGroupSpecs");
    if let Ok(groups) = resolve_path(template, &groups_path) {
        let count = groups.as_array().map(Vec::len).unwrap_or(0);
        for i in 0..count {
            let replicas = int_or(template, &format!("{groups_path}[{i}].replicas"), 1);
            sets.push(AppWrapperPodSet::new(
                &format!("{groups_path}[{i}].template"),
                Some(replicas as i32),
            ));
        }
    }

    Ok(sets)
}

/* ============================= VALIDATION ============================= */

/// Validate a component's declared pod sets: unique resolvable paths that
/// land on pod-template-spec maps, matching the inferred sets 1:1 where the
/// kind is known.
pub fn validate_pod_sets(component: &AppWrapperComponent) -> Result<(), PodSetError> {
    let declared = &component.declared_pod_sets;

    for (i, ps) in declared.iter().enumerate() {
        if declared[..i].iter().any(|other| other.path == ps.path) {
            return Err(PodSetError::DuplicatePath(ps.path.clone()));
        }

        let target = resolve_map(&component.template, &ps.path)?;
        if !target.contains_key("spec") {
            return Err(PodSetError::NotAPodTemplate(ps.path.clone()));
        }
    }

    if let Some(inferred) = infer_pod_sets(&component.template)? {
        if declared.len() != inferred.len() {
            return Err(PodSetError::CountMismatch {
                declared: declared.len(),
                inferred: inferred.len(),
            });
        }
        for ps in declared {
            let matched = inferred
                .iter()
                .find(|inf| inf.path == ps.path)
                .ok_or_else(|| PodSetError::UnmatchedPath(ps.path.clone()))?;
            let declared_replicas = ps.replicas.unwrap_or(1);
            let inferred_replicas = matched.replicas.unwrap_or(1);
            if declared_replicas != inferred_replicas {
                return Err(PodSetError::ReplicaMismatch {
                    path: ps.path.clone(),
                    declared: declared_replicas,
                    inferred: inferred_replicas,
                });
            }
        }
    }

    Ok(())
}

/* ============================= TESTS ============================= */
