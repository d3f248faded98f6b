// Cache key rendering
// Substitutes `${{ expr }}` segments in cache keys and restore prefixes

use crate::cache::archive::{checked_relative, collect_files};
use crate::cache::CacheError;
use crate::condition::{Evaluator, Expr, ExprParser, StatusSnapshot};

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const HASH_FILES: &str = "hashfiles";

/// Renders key templates for one job instance.
///
/// Besides the predicate language, a segment may be a single
/// `hashFiles('path', ...)` call: the SHA-256 over the named files (directories
/// are walked in sorted order, missing paths ignored). With nothing to hash it
/// renders as the empty string.
pub struct CacheKeyRenderer<'a> {
    snapshot: &'a StatusSnapshot,
    workspace: &'a Path,
}

impl<'a> CacheKeyRenderer<'a> {
    pub fn new(snapshot: &'a StatusSnapshot, workspace: &'a Path) -> Self {
        Self { snapshot, workspace }
    }

    pub fn render(&self, template: &str) -> Result<String, CacheError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 3..];
            let end = after
                .find("}}")
                .ok_or_else(|| CacheError::KeyExpression(format!("unterminated '${{{{' in '{}'", template)))?;
            out.push_str(&self.segment(after[..end].trim())?);
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Render a list of templates, dropping any that render empty
    pub fn render_all(&self, templates: &[String]) -> Result<Vec<String>, CacheError> {
        let mut rendered = Vec::with_capacity(templates.len());
        for template in templates {
            let key = self.render(template)?;
            if !key.is_empty() {
                rendered.push(key);
            }
        }
        Ok(rendered)
    }

    fn segment(&self, source: &str) -> Result<String, CacheError> {
        let expr = ExprParser::parse_str(source)
            .map_err(|e| CacheError::KeyExpression(format!("'{}': {}", source, e)))?;
        let evaluator = Evaluator::new(self.snapshot);

        if let Expr::Call { name, args } = &expr {
            if name.eq_ignore_ascii_case(HASH_FILES) {
                let mut patterns = Vec::with_capacity(args.len());
                for arg in args {
                    let value = evaluator
                        .eval(arg)
                        .map_err(|e| CacheError::KeyExpression(e.to_string()))?;
                    patterns.push(value.as_string());
                }
                return self.hash_files(&patterns);
            }
        }

        let mut nested = false;
        expr.walk(&mut |node| {
            if matches!(node, Expr::Call { name, .. } if name.eq_ignore_ascii_case(HASH_FILES)) {
                nested = true;
            }
        });
        if nested {
            return Err(CacheError::KeyExpression(format!(
                "'{}': hashFiles must be the whole expression",
                source
            )));
        }

        evaluator
            .eval(&expr)
            .map(|v| v.as_string())
            .map_err(|e| CacheError::KeyExpression(format!("'{}': {}", source, e)))
    }

    fn hash_files(&self, patterns: &[String]) -> Result<String, CacheError> {
        if patterns.is_empty() {
            return Err(CacheError::KeyExpression("hashFiles needs at least one path".into()));
        }
        let mut files: Vec<PathBuf> = Vec::new();
        for pattern in patterns {
            collect_files(self.workspace, &checked_relative(pattern)?, &mut files)?;
        }
        files.sort();
        files.dedup();
        if files.is_empty() {
            return Ok(String::new());
        }

        let mut hasher = Sha256::new();
        for file in &files {
            let contents = std::fs::read(self.workspace.join(file))?;
            hasher.update(Sha256::digest(&contents));
        }
        Ok(hex::encode(hasher.finalize()))
    }
}
