use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use sha2::{Digest, Sha256};

use swc_common::{FileName, SourceMap, Spanned, input::StringInput, sync::Lrc};
use swc_ecma_ast::{ModuleDecl, ModuleItem};
use swc_ecma_parser::{Parser, Syntax, lexer::Lexer};

use crate::module::diagnostics::{DependencyInfo, ModuleError, ModuleResult};
use crate::module::resolver::{ModuleResolver, ResolvedModule};
use crate::runtime::task::ModuleId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Resolved and recorded; parse task queued.
    Fetched,
    Parsed,
    Evaluating,
    Evaluated,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub id: ModuleId,
    pub key: String,
    pub path: PathBuf,
    pub specifier: String,
    pub state: ModuleState,
    pub content_hash: Option<String>,
    pub source: Option<Rc<str>>,
    /// Static import specifiers in source order, without duplicates.
    pub import_specifiers: Vec<String>,
    pub imports: Vec<ModuleId>,
    /// Module that first imported this one.
    pub importer: Option<ModuleId>,
    pub error: Option<ModuleError>,
}

/// Result of parsing one module's source.
#[derive(Debug, Clone)]
pub struct ParsedSource {
    pub imports: Vec<String>,
    pub content_hash: String,
}

/// Whether a module graph is ready to evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphStatus {
    /// Some module in the graph is still waiting to be parsed.
    Pending,
    Ready,
    Failed,
}

/// Modules keyed by canonical lower-cased path.
pub struct ModuleTable {
    resolver: ModuleResolver,
    records: Vec<ModuleRecord>,
    by_key: HashMap<String, ModuleId>,
    parse_count: usize,
}

impl Default for ModuleTable {
    fn default() -> Self {
        Self::new(ModuleResolver::new())
    }
}

impl ModuleTable {
    pub fn new(resolver: ModuleResolver) -> Self {
        Self {
            resolver,
            records: Vec::new(),
            by_key: HashMap::new(),
            parse_count: 0,
        }
    }

    pub fn resolver(&self) -> &ModuleResolver {
        &self.resolver
    }

    /// Resolve `specifier` for `importer` and return its record, creating
    /// it on first sight. The flag is true when the record is new.
    pub fn fetch(
        &mut self,
        specifier: &str,
        importer: Option<ModuleId>,
    ) -> ModuleResult<(ModuleId, bool)> {
        let resolved = match importer {
            Some(id) => {
                let path = self.path_of(id)?;
                self.resolver.resolve(specifier, Some(&path))
            }
            None => self.resolver.resolve_entry(specifier),
        }
        .map_err(|e| e.with_dependency_chain(self.dependency_chain(importer)))?;

        if let Some(&id) = self.by_key.get(&resolved.key) {
            log::trace!("module '{}' already recorded as {}", specifier, id);
            return Ok((id, false));
        }
        Ok((self.insert(resolved, importer), true))
    }

    fn insert(&mut self, resolved: ResolvedModule, importer: Option<ModuleId>) -> ModuleId {
        let id = self.records.len();
        log::debug!("module {} -> {}", id, resolved.path.display());
        self.by_key.insert(resolved.key.clone(), id);
        self.records.push(ModuleRecord {
            id,
            key: resolved.key,
            path: resolved.path,
            specifier: resolved.original_specifier,
            state: ModuleState::Fetched,
            content_hash: None,
            source: None,
            import_specifiers: Vec::new(),
            imports: Vec::new(),
            importer,
            error: None,
        });
        id
    }

    /// Read and parse a fetched module; returns its import specifiers.
    pub fn parse(&mut self, id: ModuleId) -> ModuleResult<Vec<String>> {
        let path = self.path_of(id)?;
        let result = fs::read_to_string(&path)
            .map_err(|e| ModuleError::io_error(path.clone(), e.to_string()))
            .and_then(|source| parse_module(&path, &source).map(|parsed| (source, parsed)));
        self.parse_count += 1;

        match result {
            Ok((source, parsed)) => {
                let record = &mut self.records[id];
                record.state = ModuleState::Parsed;
                record.source = Some(Rc::from(source.as_str()));
                record.content_hash = Some(parsed.content_hash);
                record.import_specifiers = parsed.imports.clone();
                Ok(parsed.imports)
            }
            Err(e) => {
                let e = e.with_dependency_chain(self.dependency_chain(Some(id)));
                self.fail(id, e.clone());
                Err(e)
            }
        }
    }

    pub fn set_imports(&mut self, id: ModuleId, imports: Vec<ModuleId>) {
        if let Some(record) = self.records.get_mut(id) {
            record.imports = imports;
        }
    }

    pub fn set_state(&mut self, id: ModuleId, state: ModuleState) {
        if let Some(record) = self.records.get_mut(id) {
            record.state = state;
        }
    }

    pub fn fail(&mut self, id: ModuleId, error: ModuleError) {
        if let Some(record) = self.records.get_mut(id) {
            record.state = ModuleState::Failed;
            if record.error.is_none() {
                record.error = Some(error);
            }
        }
    }

    pub fn get(&self, id: ModuleId) -> Option<&ModuleRecord> {
        self.records.get(id)
    }

    pub fn lookup(&self, key: &str) -> Option<&ModuleRecord> {
        self.by_key.get(key).and_then(|&id| self.records.get(id))
    }

    pub fn records(&self) -> &[ModuleRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of parse attempts made so far.
    pub fn parse_count(&self) -> usize {
        self.parse_count
    }

    pub fn graph_status(&self, root: ModuleId) -> GraphStatus {
        let mut status = GraphStatus::Ready;
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let Some(record) = self.records.get(id) else {
                continue;
            };
            match record.state {
                ModuleState::Failed => return GraphStatus::Failed,
                ModuleState::Fetched => status = GraphStatus::Pending,
                _ => stack.extend(record.imports.iter().copied()),
            }
        }
        status
    }

    /// Dependencies first; each module once even in cyclic graphs.
    pub fn evaluation_order(&self, root: ModuleId) -> Vec<ModuleId> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        self.post_order(root, &mut seen, &mut order);
        order
    }

    fn post_order(&self, id: ModuleId, seen: &mut HashSet<ModuleId>, order: &mut Vec<ModuleId>) {
        if !seen.insert(id) {
            return;
        }
        if let Some(record) = self.records.get(id) {
            for &dep in &record.imports {
                self.post_order(dep, seen, order);
            }
            order.push(id);
        }
    }

    /// Import path from the entry module down to `id`.
    pub fn dependency_chain(&self, id: Option<ModuleId>) -> Vec<DependencyInfo> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = id;
        while let Some(id) = current {
            if !seen.insert(id) {
                break;
            }
            let Some(record) = self.records.get(id) else {
                break;
            };
            chain.push(DependencyInfo::new(record.path.clone(), record.specifier.clone()));
            current = record.importer;
        }
        chain.reverse();
        chain
    }

    fn path_of(&self, id: ModuleId) -> ModuleResult<PathBuf> {
        self.records
            .get(id)
            .map(|r| r.path.clone())
            .ok_or_else(|| ModuleError::unsupported_specifier(format!("<module {}>", id)))
    }
}

/// Parse ECMAScript module source and collect its static import specifiers.
pub fn parse_module(path: &Path, source: &str) -> ModuleResult<ParsedSource> {
    let source_map: Lrc<SourceMap> = Default::default();
    let fm = source_map.new_source_file(
        FileName::Custom(path.to_string_lossy().to_string()).into(),
        source.to_string(),
    );

    let lexer = Lexer::new(
        Syntax::Es(Default::default()),
        Default::default(),
        StringInput::from(&*fm),
        None,
    );
    let mut parser = Parser::new_from(lexer);

    // Recoverable errors are reported next to a successful parse.
    let result = parser
        .parse_module()
        .and_then(|ast| match parser.take_errors().into_iter().next() {
            Some(e) => Err(e),
            None => Ok(ast),
        });

    match result {
        Ok(ast) => Ok(ParsedSource {
            imports: extract_imports(&ast),
            content_hash: content_hash(source),
        }),
        Err(e) => {
            let loc = source_map.lookup_char_pos(e.span().lo);
            Err(ModuleError::parse_error(
                format!("Parse error: {}", e.kind().msg()),
                path.to_path_buf(),
                loc.line,
                loc.col_display + 1,
            ))
        }
    }
}

/// Specifiers of `import`, `export * from` and `export {..} from`.
pub fn extract_imports(ast: &swc_ecma_ast::Module) -> Vec<String> {
    let mut imports: Vec<String> = Vec::new();
    for item in &ast.body {
        let ModuleItem::ModuleDecl(decl) = item else {
            continue;
        };
        let src = match decl {
            ModuleDecl::Import(import) => Some(&import.src),
            ModuleDecl::ExportAll(all) => Some(&all.src),
            ModuleDecl::ExportNamed(named) => named.src.as_ref(),
            _ => None,
        };
        if let Some(src) = src {
            let specifier = src.value.to_string_lossy().into_owned();
            if !imports.contains(&specifier) {
                imports.push(specifier);
            }
        }
    }
    imports
}

pub fn content_hash(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}
