// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Parses the three reference forms a build file can spell a target with:
//! `@name` (an external repository's root), `@name//path:target` (a target
//! inside an external repository) and `//path:target` (a target inside this
//! repository).

use std::fmt;

use errors::{BuildError, ErrorKind};

/// A parsed target or repository-root reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// `@name`
    Root { name: String },
    /// `@name//path:target`
    External {
        name: String,
        path: String,
        target: String,
    },
    /// `//path:target`
    Internal { path: String, target: String },
}

impl Reference {
    pub fn parse(spec: &str) -> Result<Reference, BuildError> {
        if let Some(rest) = spec.strip_prefix('@') {
            return match rest.split_once("//") {
                Some((name, path_and_target)) => {
                    let (path, target) = split_path_and_target(path_and_target, spec)?;
                    Ok(Reference::External {
                        name: name.to_string(),
                        path,
                        target,
                    })
                }
                None if !rest.is_empty() => Ok(Reference::Root {
                    name: rest.to_string(),
                }),
                None => Err(invalid(spec)),
            };
        }

        if let Some(path_and_target) = spec.strip_prefix("//") {
            let (path, target) = split_path_and_target(path_and_target, spec)?;
            return Ok(Reference::Internal { path, target });
        }

        Err(invalid(spec))
    }
}

fn split_path_and_target(path_and_target: &str, original: &str) -> Result<(String, String), BuildError> {
    match path_and_target.rsplit_once(':') {
        Some((path, target)) if !target.is_empty() => Ok((path.to_string(), target.to_string())),
        _ => Err(invalid(original)),
    }
}

fn invalid(spec: &str) -> BuildError {
    BuildError::new(
        ErrorKind::ConfigInvalid,
        format!("'{spec}' is not a valid reference; expected @name, @name//path:target or //path:target"),
    )
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Root { name } => write!(f, "@{name}"),
            Reference::External { name, path, target } => write!(f, "@{name}//{path}:{target}"),
            Reference::Internal { path, target } => write!(f, "//{path}:{target}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Reference;

    #[test]
    fn parses_a_root_reference() {
        assert_eq!(
            Reference::parse("@some_repo").unwrap(),
            Reference::Root { name: "some_repo".to_string() }
        );
    }

    #[test]
    fn parses_an_external_target_reference() {
        assert_eq!(
            Reference::parse("@some_repo//src/lib:widgets").unwrap(),
            Reference::External {
                name: "some_repo".to_string(),
                path: "src/lib".to_string(),
                target: "widgets".to_string(),
            }
        );
    }

    #[test]
    fn parses_an_internal_target_reference() {
        assert_eq!(
            Reference::parse("//src/lib:widgets").unwrap(),
            Reference::Internal {
                path: "src/lib".to_string(),
                target: "widgets".to_string(),
            }
        );
    }

    #[test]
    fn rejects_a_bare_at_sign() {
        assert!(Reference::parse("@").is_err());
    }

    #[test]
    fn rejects_a_missing_target_name() {
        assert!(Reference::parse("//src/lib:").is_err());
        assert!(Reference::parse("@some_repo//src/lib:").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(Reference::parse("not-a-reference").is_err());
    }

    #[test]
    fn round_trips_through_display() {
        for spec in ["@some_repo", "@some_repo//src/lib:widgets", "//src/lib:widgets"] {
            let parsed = Reference::parse(spec).unwrap();
            assert_eq!(parsed.to_string(), spec);
        }
    }
}
