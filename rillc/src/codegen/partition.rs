//! Codegen-unit partitioner
//!
//! Splits a MIR module into N independent codegen units (CGUs) using a
//! deterministic hash-based assignment: `cgu_of(name) = hash(name) % N`.
//! Each function's MIR content is fingerprinted independently; a CGU's
//! fingerprint combines its sorted function fingerprints, so a CGU whose
//! functions did not change keeps its fingerprint and its cached object
//! file can be reused without regenerating IR.
//!
//! Cache objects are named `<module>.cgu<index>.<fp12>.o`. Writers stage
//! into a temp file and atomically rename; a concurrent writer that loses
//! the race simply discards its temp file.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::error::{CompileError, Result};
use crate::mir::{Function, Module};

use super::llvm_text::TextCodeGen;

/// Golden-ratio hash combiner with good avalanche properties
#[inline]
fn hash_combine(h: &mut u64, value: u64) {
    *h ^= value
        .wrapping_add(0x9e3779b97f4a7c15)
        .wrapping_add(*h << 6)
        .wrapping_add(*h >> 2);
}

/// Stable FNV-1a string hash; never varies across builds or processes
fn hash_name(name: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in name.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Per-function content fingerprint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionFingerprint {
    pub name: String,
    pub mir_hash: u64,
}

/// Fingerprint a function's MIR structure: name, parameters, blocks,
/// instruction variants and result ids, terminators, attributes, flags.
/// Stable across builds for identical input.
pub fn fingerprint_function(func: &Function) -> u64 {
    let mut h = hash_name(&func.name);

    for param in &func.params {
        hash_combine(&mut h, hash_name(&param.name));
        hash_combine(&mut h, param.value_id as u64);
    }

    hash_combine(&mut h, func.blocks.len() as u64);
    for block in &func.blocks {
        hash_combine(&mut h, hash_name(&block.name));
        hash_combine(&mut h, block.instructions.len() as u64);
        for record in &block.instructions {
            hash_combine(&mut h, record.inst.discriminant() as u64);
            hash_combine(&mut h, record.result_id().unwrap_or(0) as u64);
        }
        if let Some(term) = &block.terminator {
            hash_combine(&mut h, term.discriminant() as u64);
        }
    }

    hash_combine(&mut h, func.attributes.bits() as u64);
    hash_combine(&mut h, func.is_public as u64);
    hash_combine(&mut h, (func.is_async as u64) << 1);
    hash_combine(&mut h, (func.uses_sret as u64) << 2);

    h
}

/// Combine sorted per-function fingerprints into the CGU identity
fn compose_cgu_fingerprint(fingerprints: &[FunctionFingerprint]) -> String {
    let mut sorted: Vec<u64> = fingerprints.iter().map(|fp| fp.mir_hash).collect();
    sorted.sort_unstable();
    let mut combined: u64 = 0;
    for hash in sorted {
        hash_combine(&mut combined, hash);
    }
    format!("{combined:016x}")
}

/// Result for a single codegen unit
#[derive(Debug, Clone)]
pub struct CguResult {
    pub cgu_index: usize,
    pub function_names: Vec<String>,
    pub function_fingerprints: Vec<FunctionFingerprint>,
    /// Stable hex digest identifying this CGU's contents
    pub fingerprint: String,
    pub llvm_ir: String,
}

impl CguResult {
    /// Cache object name: `<module>.cgu<index>.<fp12>.o`
    pub fn object_name(&self, module_name: &str) -> String {
        format!(
            "{}.cgu{}.{}.o",
            module_name,
            self.cgu_index,
            &self.fingerprint[..12]
        )
    }
}

/// Result of partitioning a module
#[derive(Debug, Clone, Default)]
pub struct PartitionResult {
    pub cgus: Vec<CguResult>,
}

/// Options for CGU partitioning
#[derive(Debug, Clone)]
pub struct PartitionOptions {
    /// Maximum number of CGUs; capped at the function count
    pub num_cgus: usize,
    pub target_triple: Option<String>,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            num_cgus: 16,
            target_triple: None,
        }
    }
}

/// Partitions a MIR module into independent codegen units
pub struct CodegenPartitioner {
    options: PartitionOptions,
}

impl CodegenPartitioner {
    pub fn new(options: PartitionOptions) -> Self {
        Self { options }
    }

    /// Deterministic function-to-CGU assignment
    pub fn assign_cgu(func_name: &str, num_cgus: usize) -> usize {
        (hash_name(func_name) % num_cgus as u64) as usize
    }

    fn codegen(&self) -> TextCodeGen {
        match &self.options.target_triple {
            Some(triple) => TextCodeGen::with_target(triple.clone()),
            None => TextCodeGen::new(),
        }
    }

    /// Partition a module into at most `num_cgus` units.
    ///
    /// An empty module produces zero CGUs; a single effective unit takes
    /// the monolithic path and emits the whole module at once.
    pub fn partition(&self, module: &Module) -> Result<PartitionResult> {
        let mut result = PartitionResult::default();
        if module.functions.is_empty() {
            return Ok(result);
        }

        let all_fingerprints: Vec<FunctionFingerprint> = module
            .functions
            .iter()
            .map(|f| FunctionFingerprint {
                name: f.name.clone(),
                mir_hash: fingerprint_function(f),
            })
            .collect();

        let effective = self.options.num_cgus.min(module.functions.len()).max(1);

        if effective == 1 {
            let llvm_ir = self
                .codegen()
                .generate(module)
                .map_err(|e| CompileError::codegen(e.to_string()))?;
            let fingerprint = compose_cgu_fingerprint(&all_fingerprints);
            result.cgus.push(CguResult {
                cgu_index: 0,
                function_names: module.functions.iter().map(|f| f.name.clone()).collect(),
                function_fingerprints: all_fingerprints,
                fingerprint,
                llvm_ir,
            });
            return Ok(result);
        }

        // Deterministic assignment, insertion-ordered per unit
        let mut assignment: IndexMap<usize, Vec<usize>> = IndexMap::new();
        for (index, func) in module.functions.iter().enumerate() {
            let cgu = Self::assign_cgu(&func.name, effective);
            assignment.entry(cgu).or_default().push(index);
        }

        for cgu_index in 0..effective {
            let Some(func_indices) = assignment.get(&cgu_index) else {
                continue; // hash distribution gap, no empty CGUs
            };
            let llvm_ir = self
                .codegen()
                .generate_cgu(module, func_indices)
                .map_err(|e| CompileError::codegen(e.to_string()))?;
            let function_fingerprints: Vec<FunctionFingerprint> = func_indices
                .iter()
                .map(|&i| all_fingerprints[i].clone())
                .collect();
            let fingerprint = compose_cgu_fingerprint(&function_fingerprints);
            result.cgus.push(CguResult {
                cgu_index,
                function_names: func_indices
                    .iter()
                    .map(|&i| module.functions[i].name.clone())
                    .collect(),
                function_fingerprints,
                fingerprint,
                llvm_ir,
            });
        }

        tracing::debug!(
            functions = module.functions.len(),
            cgus = result.cgus.len(),
            requested = effective,
            "cgu partitioning finished"
        );
        Ok(result)
    }
}

/// Shared object cache keyed by CGU object names.
///
/// Safe under concurrent writers: each writes a temp file in the cache
/// directory and atomically renames it to the final name; a writer that
/// finds the object already present discards its temp file.
#[derive(Debug, Clone)]
pub struct ObjectCache {
    dir: PathBuf,
}

impl ObjectCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, object_name: &str) -> PathBuf {
        self.dir.join(object_name)
    }

    /// A hit means the object for this fingerprint needs no recompilation
    pub fn is_cached(&self, object_name: &str) -> bool {
        self.path_of(object_name).exists()
    }

    /// Store an object under its fingerprint name; returns false when a
    /// concurrent writer already produced it
    pub fn store(&self, object_name: &str, contents: &[u8]) -> Result<bool> {
        fs::create_dir_all(&self.dir)?;
        let final_path = self.path_of(object_name);
        if final_path.exists() {
            return Ok(false);
        }

        let mut temp = tempfile::NamedTempFile::new_in(&self.dir)?;
        temp.write_all(contents)?;
        match temp.persist(&final_path) {
            Ok(_) => Ok(true),
            Err(error) => {
                // Lost the race: the named object appeared meanwhile
                if final_path.exists() {
                    Ok(false)
                } else {
                    Err(CompileError::io(error.to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::types::{Type, TypeRef};
    use crate::mir::{BinOp, Inst, InstructionRecord, Terminator};
    use crate::tir::Span;
    use std::rc::Rc;

    fn i64_ty() -> TypeRef {
        Rc::new(Type::I64)
    }

    fn const_function(name: &str, value: i128) -> Function {
        let mut f = Function::new(name, vec![], i64_ty(), Span::default());
        let entry = f.add_block("entry");
        let v = f.fresh_value(i64_ty());
        f.push_inst(
            entry,
            InstructionRecord::new(
                Inst::ConstInt {
                    value,
                    bits: 64,
                    signed: true,
                },
                Some(v.clone()),
                Span::default(),
            ),
        );
        f.set_terminator(entry, Terminator::Return(Some(v)));
        f
    }

    fn four_function_module() -> Module {
        let mut module = Module::new("app");
        for (name, value) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
            module.functions.push(const_function(name, value));
        }
        module
    }

    #[test]
    fn test_empty_module_zero_cgus() {
        let module = Module::new("empty");
        let partitioner = CodegenPartitioner::new(PartitionOptions::default());
        let result = partitioner.partition(&module).unwrap();
        assert!(result.cgus.is_empty());
    }

    #[test]
    fn test_single_function_takes_monolithic_path() {
        let mut module = Module::new("one");
        module.functions.push(const_function("only", 7));
        let partitioner = CodegenPartitioner::new(PartitionOptions {
            num_cgus: 8,
            target_triple: Some("x86_64-unknown-linux-gnu".to_string()),
        });
        let result = partitioner.partition(&module).unwrap();
        assert_eq!(result.cgus.len(), 1);
        assert_eq!(result.cgus[0].cgu_index, 0);
        assert_eq!(result.cgus[0].function_names, vec!["only".to_string()]);
        assert!(result.cgus[0].llvm_ir.contains("define internal i64 @only"));
    }

    #[test]
    fn test_assignment_is_deterministic() {
        for name in ["alpha", "beta", "gamma"] {
            assert_eq!(
                CodegenPartitioner::assign_cgu(name, 4),
                CodegenPartitioner::assign_cgu(name, 4)
            );
        }
    }

    #[test]
    fn test_partition_twice_identical_fingerprints() {
        let module = four_function_module();
        let partitioner = CodegenPartitioner::new(PartitionOptions {
            num_cgus: 2,
            target_triple: Some("x86_64-unknown-linux-gnu".to_string()),
        });
        let first = partitioner.partition(&module).unwrap();
        let second = partitioner.partition(&module).unwrap();

        assert_eq!(first.cgus.len(), second.cgus.len());
        for (a, b) in first.cgus.iter().zip(second.cgus.iter()) {
            assert_eq!(a.fingerprint, b.fingerprint);
            assert_eq!(a.llvm_ir, b.llvm_ir);
        }
    }

    #[test]
    fn test_changing_one_function_perturbs_only_its_cgu() {
        let module = four_function_module();
        let partitioner = CodegenPartitioner::new(PartitionOptions {
            num_cgus: 2,
            target_triple: Some("x86_64-unknown-linux-gnu".to_string()),
        });
        let before = partitioner.partition(&module).unwrap();

        // Change `a`'s body
        let mut changed = four_function_module();
        {
            let f = changed.function_mut("a").unwrap();
            let extra = f.fresh_value(i64_ty());
            let entry_id = f.blocks[0].id;
            let ret_value = match &f.blocks[0].terminator {
                Some(Terminator::Return(Some(v))) => v.clone(),
                _ => panic!("expected return"),
            };
            f.blocks[0].terminator = None;
            f.push_inst(
                entry_id,
                InstructionRecord::new(
                    Inst::Binary {
                        op: BinOp::Add,
                        lhs: ret_value.clone(),
                        rhs: ret_value,
                    },
                    Some(extra.clone()),
                    Span::default(),
                ),
            );
            f.set_terminator(entry_id, Terminator::Return(Some(extra)));
        }
        let after = partitioner.partition(&changed).unwrap();

        let cgu_of_a = CodegenPartitioner::assign_cgu("a", 2);
        for (b, a) in before.cgus.iter().zip(after.cgus.iter()) {
            assert_eq!(b.cgu_index, a.cgu_index);
            if b.cgu_index == cgu_of_a {
                assert_ne!(b.fingerprint, a.fingerprint);
            } else {
                assert_eq!(b.fingerprint, a.fingerprint);
            }
        }
    }

    #[test]
    fn test_function_fingerprint_stable_across_runs() {
        let f1 = const_function("same", 42);
        let f2 = const_function("same", 42);
        assert_eq!(fingerprint_function(&f1), fingerprint_function(&f2));

        let f3 = const_function("other", 42);
        assert_ne!(fingerprint_function(&f1), fingerprint_function(&f3));
    }

    #[test]
    fn test_object_name_uses_twelve_digit_prefix() {
        let mut module = Module::new("app");
        module.functions.push(const_function("f", 1));
        let partitioner = CodegenPartitioner::new(PartitionOptions {
            num_cgus: 1,
            target_triple: Some("x86_64-unknown-linux-gnu".to_string()),
        });
        let result = partitioner.partition(&module).unwrap();
        let name = result.cgus[0].object_name("app");
        assert!(name.starts_with("app.cgu0."));
        assert!(name.ends_with(".o"));
        let fp_part = name
            .trim_start_matches("app.cgu0.")
            .trim_end_matches(".o");
        assert_eq!(fp_part.len(), 12);
    }

    #[test]
    fn test_object_cache_store_and_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ObjectCache::new(dir.path());

        assert!(!cache.is_cached("app.cgu0.abcdef123456.o"));
        assert!(cache.store("app.cgu0.abcdef123456.o", b"object").unwrap());
        assert!(cache.is_cached("app.cgu0.abcdef123456.o"));
        // A duplicate writer detects the existing object
        assert!(!cache.store("app.cgu0.abcdef123456.o", b"object").unwrap());
    }
}
