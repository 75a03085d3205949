#[path = "common/mod.rs"]
mod common;

#[path = "module/module_load.rs"]
mod module_load;
#[path = "module/module_methods.rs"]
mod module_methods;
#[path = "module/module_execute.rs"]
mod module_execute;
#[path = "module/module_outputs.rs"]
mod module_outputs;
#[path = "module/module_trace.rs"]
mod module_trace;

#[path = "memory/memory_plan.rs"]
mod memory_plan;

#[path = "program/program_parse.rs"]
mod program_parse;
