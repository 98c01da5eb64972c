mod fake_interpreter;
mod perf_map;
