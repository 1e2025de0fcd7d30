//! Execution engine: loads a module, translates or fetches it from the
//! cache, and runs it.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::c_void;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::context::VmContext;
use super::scheduler::{Scheduler, TaskError, TaskId};
use super::services::Service;
use crate::analysis::{AnalysisError, ProgramAnalysis};
use crate::cache::{CacheMetadata, CachedObject, FORMAT_VERSION, ObjectCache};
use crate::config::{DivideByZeroPolicy, MemoryConfig, VmOptions};
use crate::isa::{PoolItems, Register};
use crate::jit::backend::{self, BackendError};
use crate::jit::lookup::{self, HEADER_SLOTS, LookupTable, UNRESOLVED_SLOT};
use crate::jit::memory::{ExecutableMemory, MemoryError};
use crate::jit::services::ServiceTrampolines;
use crate::jit::translator::{HleHandler, Routine, TranslateError, TranslateOptions, Translator};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error("text segment starting at {text_base:#x} is outside guest memory ({memory_size} bytes)")]
    TextOutOfMemory { text_base: u32, memory_size: usize },
    #[error("no translated function at entry point {0:#x}")]
    MissingEntry(u32),
    #[error("register index {0} is outside the register file")]
    InvalidRegister(usize),
    #[error("the zero register cannot be written")]
    WriteToZeroRegister,
}

/// HLE handler that only logs the call.
pub unsafe extern "C" fn log_hle_call(_userdata: *mut c_void, code: i32) {
    debug!(code, "unhandled host call");
}

/// Lookup-table target for guest addresses nothing was translated for.
unsafe extern "C" fn unresolved_call(
    ctx: *mut VmContext,
    _mem: *mut u8,
    _lookup: *mut usize,
    _hle: HleHandler,
    _userdata: *mut c_void,
) {
    // SAFETY: generated code passes its live register file.
    let pc = unsafe { (*ctx).get(Register::Pc) };
    warn!(address = format_args!("{pc:#x}"), "indirect call to an untranslated address");
}

/// FNV-1a over everything the generated code depends on.
struct Fingerprint(u64);

impl Fingerprint {
    fn new() -> Self {
        Self(0xCBF2_9CE4_8422_2325)
    }

    fn bytes(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 ^= u64::from(byte);
            self.0 = self.0.wrapping_mul(0x0000_0100_0000_01B3);
        }
    }

    fn u32(&mut self, value: u32) {
        self.bytes(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.bytes(&value.to_le_bytes());
    }
}

/// Text segment bounds `[start, end)`, clipped to guest memory.
fn text_bounds(options: &VmOptions, memory_size: usize) -> Result<(u32, u32), EngineError> {
    let memory_end = u32::try_from(memory_size).unwrap_or(u32::MAX);
    if options.text_base >= memory_end {
        return Err(EngineError::TextOutOfMemory {
            text_base: options.text_base,
            memory_size,
        });
    }
    let size = options.text_size.unwrap_or(memory_end - options.text_base);
    Ok((options.text_base, options.text_base.saturating_add(size).min(memory_end)))
}

fn fingerprint(memory: &[u8], start: u32, end: u32, pool: &[u64], options: &VmOptions) -> u64 {
    let mut hash = Fingerprint::new();
    hash.u32(FORMAT_VERSION);
    hash.u32(start);
    hash.u32(end);
    hash.u32(options.entry_point);
    hash.bytes(&memory[start as usize..end as usize]);
    for &item in pool {
        hash.u64(item);
    }
    hash.u32(match options.divide_by_zero {
        DivideByZeroPolicy::ZeroResult => 0,
        DivideByZeroPolicy::Trap => 1,
    });
    for import in &options.service_imports {
        hash.u32(import.pool_index);
        hash.u32(import.service as u32);
    }
    hash.0
}

/// A loaded module ready to run.
pub struct Engine {
    name: String,
    // Dropped first: suspended tasks reference the code and the context.
    scheduler: Box<Scheduler>,
    trampolines: ServiceTrampolines,
    code: ExecutableMemory,
    lookup: LookupTable,
    context: Box<VmContext>,
    memory: Vec<u8>,
    populate_offset: usize,
    populated: bool,
    entry: u32,
    uses_task_subsystem: bool,
    function_count: usize,
    loaded_from_cache: bool,
}

impl Engine {
    pub fn new(name: &str, config: MemoryConfig, options: VmOptions) -> Result<Self, EngineError> {
        backend::initialize()?;

        let MemoryConfig {
            memory,
            pool_items,
            stack,
        } = config;
        let (text_start, text_end) = text_bounds(&options, memory.len())?;
        let entry = text_start.wrapping_add(options.entry_point);
        let lookup_entries = lookup::entry_count(text_end);
        let fingerprint = fingerprint(&memory, text_start, text_end, &pool_items, &options);

        let cache = options.cache.then(|| ObjectCache::new(options.cache_root()));
        let cached = cache
            .as_ref()
            .and_then(|cache| cache.load(name))
            .filter(|object| object.metadata.fingerprint == fingerprint);

        let (object, loaded_from_cache) = match cached {
            Some(object) => {
                info!(module = name, bytes = object.code.len(), "loaded translated module from cache");
                (object, true)
            }
            None => {
                let pool = PoolItems::new(pool_items);
                let services: BTreeMap<u32, _> = options
                    .service_imports
                    .iter()
                    .map(|import| (import.pool_index, import.service))
                    .collect();
                let service_indices: BTreeSet<u32> = services.keys().copied().collect();

                let functions = ProgramAnalysis::new(
                    &memory,
                    text_start,
                    text_end - text_start,
                    &pool,
                    &service_indices,
                )
                .analyze(options.entry_point)?;
                let translate_options = TranslateOptions {
                    divide_by_zero: options.divide_by_zero,
                    services,
                    lookup_entries,
                };
                let module = Translator::new(&memory, &pool, translate_options)?.translate(&functions)?;
                let object = CachedObject {
                    code: module.code,
                    populate_offset: module.populate_offset as u32,
                    metadata: CacheMetadata {
                        format_version: FORMAT_VERSION,
                        uses_task_subsystem: module.uses_task_subsystem,
                        services: module.services,
                        function_count: module.function_count,
                        fingerprint,
                    },
                };
                if let Some(cache) = &cache {
                    cache.store(name, &object);
                }
                (object, false)
            }
        };

        let code = ExecutableMemory::from_code(&object.code)?;
        let scheduler = Box::new(Scheduler::new(options.task_stack_size));
        scheduler.set_stack_callbacks(stack);
        let trampolines = ServiceTrampolines::build(&*scheduler, &object.metadata.services)?;
        let mut lookup = LookupTable::new(text_end, unresolved_call as usize);
        trampolines.install(&mut lookup);

        let mut context = Box::new(VmContext::new());
        scheduler.set_main_context(&mut *context);

        debug!(
            module = name,
            functions = object.metadata.function_count,
            code_bytes = object.code.len(),
            entry = format_args!("{entry:#x}"),
            "engine ready"
        );
        Ok(Self {
            name: name.to_string(),
            scheduler,
            trampolines,
            code,
            lookup,
            context,
            memory,
            populate_offset: object.populate_offset as usize,
            populated: false,
            entry,
            uses_task_subsystem: object.metadata.uses_task_subsystem,
            function_count: object.metadata.function_count,
            loaded_from_cache,
        })
    }

    /// Run the populate trampoline once.
    fn populate(&mut self, handler: HleHandler, userdata: *mut c_void) -> Result<(), EngineError> {
        if self.populated {
            return Ok(());
        }
        // SAFETY: the populate trampoline has the routine signature.
        let populate: Routine = unsafe { self.code.entry(self.populate_offset) }.ok_or(MemoryError::InvalidSize)?;
        // SAFETY: the lookup table covers every translated address.
        unsafe {
            populate(
                &mut *self.context,
                self.memory.as_mut_ptr(),
                self.lookup.as_mut_ptr(),
                handler,
                userdata,
            )
        };
        self.populated = true;
        Ok(())
    }

    /// Native routine of the entry function.
    fn entry_routine(&self) -> Result<Routine, EngineError> {
        match self.lookup.routine(self.entry) {
            Some(addr) if addr != unresolved_call as usize => {
                // SAFETY: populated slots hold translated routines.
                Ok(unsafe { std::mem::transmute::<usize, Routine>(addr) })
            }
            _ => Err(EngineError::MissingEntry(self.entry)),
        }
    }

    /// Run the entry function on the host stack.
    ///
    /// Task services still work but never switch: yield and kill return at
    /// once and created tasks stay queued.
    pub fn execute(&mut self, handler: HleHandler, userdata: *mut c_void) -> Result<(), EngineError> {
        self.populate(handler, userdata)?;
        let routine = self.entry_routine()?;
        self.scheduler.set_userdata(userdata);
        self.context.set(Register::Pc, self.entry);
        debug!(module = %self.name, "executing");
        // SAFETY: the context, memory and lookup table outlive the call.
        unsafe {
            routine(
                &mut *self.context,
                self.memory.as_mut_ptr(),
                self.lookup.as_mut_ptr(),
                handler,
                userdata,
            )
        };
        Ok(())
    }

    /// Run the entry function as a task and drive the scheduler until no
    /// task is ready. The entry task's final registers become the engine's.
    pub fn execute_task_aware(&mut self, handler: HleHandler, userdata: *mut c_void) -> Result<(), EngineError> {
        self.populate(handler, userdata)?;
        self.entry_routine()?;
        self.scheduler.set_userdata(userdata);
        self.context.set(Register::Pc, self.entry);

        let memory = self.memory.as_mut_ptr();
        let lookup = self.lookup.as_mut_ptr();
        let limit = HEADER_SLOTS + self.lookup.entries();
        self.scheduler
            .set_runner(Rc::new(move |_: &Scheduler, _: TaskId, entry: u32, context: *mut VmContext| {
                let slot = HEADER_SLOTS + (entry >> 2) as usize;
                let slot = if slot < limit { slot } else { UNRESOLVED_SLOT };
                // SAFETY: every slot holds a routine address and the engine
                // keeps memory and the table alive while tasks run.
                unsafe {
                    let routine = std::mem::transmute::<usize, Routine>(*lookup.add(slot));
                    routine(context, memory, lookup, handler, userdata);
                }
            }));

        let id = self.scheduler.create_entry_task(self.entry)?;
        debug!(module = %self.name, task = id, "executing with tasks");
        let outcome = self.scheduler.run();
        if let Some(result) = self.scheduler.take_entry_result() {
            *self.context = result;
        }
        outcome?;
        Ok(())
    }

    pub fn reg(&self, reg: Register) -> u32 {
        self.context.get(reg)
    }

    pub fn set_reg(&mut self, reg: Register, value: u32) -> Result<(), EngineError> {
        if reg == Register::Zr {
            return Err(EngineError::WriteToZeroRegister);
        }
        self.context.set(reg, value);
        Ok(())
    }

    /// Register by slot index.
    pub fn reg_raw(&self, index: usize) -> Result<u32, EngineError> {
        self.context.raw(index).ok_or(EngineError::InvalidRegister(index))
    }

    pub fn set_reg_raw(&mut self, index: usize, value: u32) -> Result<(), EngineError> {
        if index == Register::Zr.index() {
            return Err(EngineError::WriteToZeroRegister);
        }
        if self.context.set_raw(index, value) {
            Ok(())
        } else {
            Err(EngineError::InvalidRegister(index))
        }
    }

    pub fn context_ptr(&mut self) -> *mut VmContext {
        &mut *self.context
    }

    pub fn scheduler_ptr(&self) -> *const Scheduler {
        &*self.scheduler
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    pub fn memory_ptr(&mut self) -> *mut u8 {
        self.memory.as_mut_ptr()
    }

    pub fn uses_task_subsystem(&self) -> bool {
        self.uses_task_subsystem
    }

    pub fn function_count(&self) -> usize {
        self.function_count
    }

    pub fn loaded_from_cache(&self) -> bool {
        self.loaded_from_cache
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Native address of a service trampoline. Only services the module
    /// calls have one.
    pub fn service_address(&self, service: Service) -> Option<usize> {
        self.trampolines.address(service)
    }
}
