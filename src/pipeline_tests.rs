//! End-to-end module transforms
//!
//! Each test feeds a whole module through `transform_module` and checks the
//! emitted text, records and manifest together.

#[cfg(test)]
mod tests {
    use crate::directive::FunctionKind;
    use crate::finalize::extract_manifest_annotation;
    use crate::scope::ClosureOrigin;
    use crate::transform::{transform_module, ModuleOutput, TransformOptions};

    fn run(file: &str, source: &str) -> ModuleOutput {
        match transform_module(source, &TransformOptions::for_file(file)) {
            Ok(output) => output,
            Err(e) => panic!("transform failed:\n{}", e),
        }
    }

    fn position(code: &str, needle: &str) -> usize {
        code.find(needle)
            .unwrap_or_else(|| panic!("missing {:?} in:\n{}", needle, code))
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // TOP-LEVEL FUNCTIONS
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_top_level_step_exact_output() {
        let source = "export async function add(a, b) {\n  \"use step\";\n  return a + b;\n}\n";
        let output = run("input.js", source);
        let expected = concat!(
            r#"/**__internal_workflows{"steps":{"input.js":{"add":{"stepId":"step//input.js//add"}}}}*/;"#,
            "\n",
            "import { registerStepFunction } from \"workflow/internal/private\";\n",
            "export async function add(a, b) {\n  \n  return a + b;\n}\n",
            "registerStepFunction(\"step//input.js//add\", add);\n",
        );
        assert_eq!(output.code, expected);
        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].local_name, "add");
        assert!(output.records[0].closure_vars.is_empty());
    }

    #[test]
    fn test_parallel_steps_benchmark() {
        let source = r#"
async function work(i: number): Promise<number> {
  'use step';
  return i;
}

export async function parallelSteps(count: number): Promise<number[]> {
  'use workflow';
  const promises = Array.from({ length: count }, (_, i) => work(i));
  return Promise.all(promises);
}
"#;
        let output = run("parallel-steps.ts", source);
        assert!(output.diagnostics.is_empty(), "{:?}", output.diagnostics);
        assert!(output
            .code
            .contains(r#"(_, i) => __private_useStep("step//parallel-steps.ts//work")(i)"#));
        assert!(output.code.contains("async function work(i: number): Promise<number> {"));
        assert!(output
            .code
            .contains(r#"registerStepFunction("step//parallel-steps.ts//work", work);"#));
        assert!(output.code.contains(
            r#"registerWorkflowFunction("workflow//parallel-steps.ts//parallelSteps", parallelSteps);"#
        ));
        assert_eq!(
            output.manifest.workflows["parallel-steps.ts"]["parallelSteps"].workflow_id,
            "workflow//parallel-steps.ts//parallelSteps"
        );
        assert_eq!(
            output.manifest.steps["parallel-steps.ts"]["work"].step_id,
            "step//parallel-steps.ts//work"
        );
    }

    #[test]
    fn test_sequential_steps_benchmark_awaits_dispatch() {
        let source = r#"
async function work(i: number): Promise<number> {
  'use step';
  return i;
}

export async function sequentialSteps(count: number): Promise<number[]> {
  'use workflow';
  const results: number[] = [];
  for (let i = 0; i < count; i++) {
    results.push(await work(i));
  }
  return results;
}
"#;
        let output = run("sequential-steps.ts", source);
        assert!(output
            .code
            .contains(r#"results.push(await __private_useStep("step//sequential-steps.ts//work")(i));"#));
    }

    #[test]
    fn test_top_level_step_called_from_plain_code_stays_direct() {
        let source = r#"
export async function compute(a, b) {
  "use step";
  return a + b;
}
export const direct = () => compute(1, 2);
"#;
        let output = run("input.js", source);
        assert!(output.code.contains("() => compute(1, 2)"));
        assert!(!output.code.contains("__private_useStep"));
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // NESTED STEPS
    // ═══════════════════════════════════════════════════════════════════════════════

    const NESTED_CLOSURE: &str = r#"import { DurableAgent } from '@workflow/ai/agent';
import { gateway } from 'ai';

export async function wflow() {
    'use workflow';
    let count = 42;
    async function namedStepWithClosureVars() {
        'use step';
        console.log('count', count);
    }
    const agent = new DurableAgent({
        arrowFunctionWithClosureVars: async () => {
            'use step';
            console.log('count', count);
            return gateway('openai/gpt-5');
        },
        namedFunctionWithClosureVars: async function () {
            'use step';
            console.log('count', count);
        },
        async methodWithClosureVars() {
            'use step';
            console.log('count', count);
        },
    });
    await namedStepWithClosureVars();
    return agent;
}
"#;

    #[test]
    fn test_nested_steps_with_closure_ids_and_locals() {
        let output = run("input.js", NESTED_CLOSURE);
        let summary: Vec<(FunctionKind, &str, &str)> = output
            .records
            .iter()
            .map(|r| (r.kind, r.local_name.as_str(), r.qualified_id.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (FunctionKind::Workflow, "wflow", "workflow//input.js//wflow"),
                (
                    FunctionKind::Step,
                    "wflow$namedStepWithClosureVars",
                    "step//input.js//wflow/namedStepWithClosureVars"
                ),
                (FunctionKind::Step, "wflow$_anonymousStep0", "step//input.js//wflow/_anonymousStep0"),
                (FunctionKind::Step, "wflow$_anonymousStep1", "step//input.js//wflow/_anonymousStep1"),
                (FunctionKind::Step, "wflow$_anonymousStep2", "step//input.js//wflow/_anonymousStep2"),
            ]
        );
        for record in &output.records[1..] {
            assert_eq!(record.closure_vars.len(), 1);
            assert_eq!(record.closure_vars[0].name, "count");
            assert_eq!(record.closure_vars[0].origin, ClosureOrigin::Workflow);
        }
    }

    #[test]
    fn test_nested_steps_with_closure_rewrite() {
        let code = run("input.js", NESTED_CLOSURE).code;

        assert_eq!(code.matches("const { count } = __private_getClosureVars();").count(), 4);
        assert!(!code.contains("use step"));
        assert!(!code.contains("use workflow"));

        for id in [
            "wflow/namedStepWithClosureVars",
            "wflow/_anonymousStep0",
            "wflow/_anonymousStep1",
            "wflow/_anonymousStep2",
        ] {
            let registration = format!("registerStepFunction(\"step//input.js//{}\"", id);
            assert_eq!(code.matches(&registration).count(), 1, "{}", registration);
        }

        // Hoisted above the workflow, registered before the workflow can run.
        let workflow_start = position(&code, "export async function wflow()");
        assert!(position(&code, "async function wflow$namedStepWithClosureVars() {") < workflow_start);
        assert!(position(&code, "const wflow$_anonymousStep0 = async () => {") < workflow_start);
        assert!(position(&code, "async function wflow$_anonymousStep1() {") < workflow_start);
        assert!(position(&code, "async function wflow$_anonymousStep2() {") < workflow_start);

        // Original positions now refer to the hoisted implementations.
        assert!(code.contains("arrowFunctionWithClosureVars: wflow$_anonymousStep0,"));
        assert!(code.contains("namedFunctionWithClosureVars: wflow$_anonymousStep1,"));
        assert!(code.contains("methodWithClosureVars: wflow$_anonymousStep2,"));
        assert!(code.contains(
            r#"await __private_useStep("step//input.js//wflow/namedStepWithClosureVars", () => ({ count }))();"#
        ));
        assert!(code.contains("let count = 42;"));
        assert!(code.contains(
            "import { __private_getClosureVars, __private_useStep, registerStepFunction, registerWorkflowFunction } from \"workflow/internal/private\";"
        ));
    }

    #[test]
    fn test_non_call_references_point_at_hoisted_step() {
        let source = r#"
export async function flow() {
  "use workflow";
  async function lookup(id) {
    "use step";
    return id;
  }
  const tools = [lookup];
  const registry = { lookup };
  return { tools, registry };
}
"#;
        let code = run("input.js", source).code;
        assert!(code.contains("const tools = [flow$lookup];"));
        assert!(code.contains("const registry = { lookup: flow$lookup };"));
    }

    #[test]
    fn test_recursive_function_expression_step() {
        let source = r#"
export async function wf(n) {
  "use workflow";
  return await run(async function fact(k) {
    "use step";
    console.log(fact.name);
    return k <= 1 ? 1 : k * await fact(k - 1);
  }, n);
}
"#;
        let output = run("input.js", source);
        assert_eq!(output.records[1].local_name, "wf$fact");
        assert_eq!(output.records[1].qualified_id, "step//input.js//wf/fact");
        assert!(output.records[1].closure_vars.is_empty());

        let code = &output.code;
        assert!(code.contains("async function wf$fact(k) {"), "{}", code);
        assert!(code.contains("console.log(wf$fact.name);"));
        assert!(code.contains(r#"k * await __private_useStep("step//input.js//wf/fact")(k - 1);"#));
        assert!(code.contains("return await run(wf$fact, n);"));
        assert!(!code.contains(" fact("));
    }

    #[test]
    fn test_step_nested_in_plain_function() {
        let source = r#"
export function makeTagger(prefix) {
  async function tag(value) {
    "use step";
    return prefix + value;
  }
  return tag;
}
"#;
        let output = run("input.js", source);
        let record = &output.records[0];
        assert_eq!(record.local_name, "tag$1");
        assert_eq!(record.qualified_id, "step//input.js//tag");
        assert_eq!(record.closure_vars[0].name, "prefix");
        assert_eq!(record.closure_vars[0].origin, ClosureOrigin::Function);
        assert!(output.code.contains("return tag$1;"));
        assert!(output.code.contains("const { prefix } = __private_getClosureVars();"));
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // NAMING
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_default_export_collision() {
        let source = r#"// Existing variable named __default
const __default = "existing variable";
console.log(__default);
export default async function() {
    'use workflow';
    const result = await someStep();
    return result;
}
"#;
        let output = run("input.js", source);
        assert!(output.code.starts_with(
            r#"/**__internal_workflows{"workflows":{"input.js":{"default":{"workflowId":"workflow//input.js//__default$1"}}}}*/;"#
        ));
        assert!(output.code.contains("const __default = \"existing variable\";"));
        assert!(output.code.contains("export default async function __default$1() {"));
        assert!(output
            .code
            .contains(r#"registerWorkflowFunction("workflow//input.js//__default$1", __default$1);"#));
        assert_eq!(output.records[0].export_names, vec!["default".to_string()]);
    }

    #[test]
    fn test_default_export_arrow_without_collision() {
        let source = "export default async () => {\n  'use workflow';\n  return 1;\n};\n";
        let output = run("input.js", source);
        assert_eq!(output.records[0].local_name, "__default");
        assert!(output.code.contains("const __default = async () => {"));
        assert!(output.code.contains("export default __default;"));
        assert!(output.manifest.workflows["input.js"].contains_key("default"));
    }

    #[test]
    fn test_default_export_name_spacing() {
        let source = "export default async function () {\n  'use workflow';\n  return 1;\n}\n";
        let code = run("input.js", source).code;
        assert!(code.contains("export default async function __default() {"), "{}", code);
    }

    #[test]
    fn test_anonymous_numbering_per_kind() {
        let source = r#"
register(async () => { "use step"; return 1; });
register(async () => { "use workflow"; return 2; });
register(async function () { "use step"; return 3; });
"#;
        let output = run("input.js", source);
        let locals: Vec<&str> = output.records.iter().map(|r| r.local_name.as_str()).collect();
        assert_eq!(locals, vec!["_anonymousStep0", "_anonymousWorkflow0", "_anonymousStep1"]);
        assert!(output.code.contains("register(_anonymousStep0);"));
        assert!(output.code.contains("register(_anonymousWorkflow0);"));
        assert!(output.code.contains("register(_anonymousStep1);"));
        let ids: Vec<&str> = output.records.iter().map(|r| r.qualified_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "step//input.js//_anonymousStep0",
                "workflow//input.js//_anonymousWorkflow0",
                "step//input.js//_anonymousStep1",
            ]
        );
    }

    #[test]
    fn test_sibling_steps_with_same_name_get_unique_segments() {
        let source = r#"
export async function flow(flag) {
  "use workflow";
  if (flag) {
    async function save() { "use step"; return 1; }
    return save();
  } else {
    async function save() { "use step"; return 2; }
    return save();
  }
}
"#;
        let output = run("input.js", source);
        let ids: Vec<&str> = output.records.iter().map(|r| r.qualified_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "workflow//input.js//flow",
                "step//input.js//flow/save",
                "step//input.js//flow/save$1",
            ]
        );
        assert_eq!(output.records[1].local_name, "flow$save");
        assert_eq!(output.records[2].local_name, "flow$save$1");
    }

    #[test]
    fn test_class_methods() {
        let source = r#"
export class Jobs {
  static async send(to) {
    "use step";
    return to;
  }
  async run() {
    "use workflow";
    return Jobs.send(this.target);
  }
}
"#;
        let output = run("input.js", source);
        let ids: Vec<(&str, &str)> = output
            .records
            .iter()
            .map(|r| (r.local_name.as_str(), r.qualified_id.as_str()))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("Jobs$send", "step//input.js//Jobs.send"),
                ("Jobs$run", "workflow//input.js//Jobs#run"),
            ]
        );
        let code = &output.code;
        assert!(code.contains("static async send(to) { return Jobs$send.apply(this, arguments); }"));
        assert!(code.contains("async run() { return Jobs$run.apply(this, arguments); }"));
        assert!(position(code, "async function Jobs$send(to) {") < position(code, "export class Jobs"));
    }

    #[test]
    fn test_runtime_helper_names_are_hygienic() {
        let source = r#"
const registerStepFunction = "taken";
export async function work() {
  "use step";
  return registerStepFunction;
}
"#;
        let code = run("input.js", source).code;
        assert!(code.contains(
            "import { registerStepFunction as registerStepFunction$1 } from \"workflow/internal/private\";"
        ));
        assert!(code.contains(r#"registerStepFunction$1("step//input.js//work", work);"#));
    }

    // ═══════════════════════════════════════════════════════════════════════════════
    // STABILITY
    // ═══════════════════════════════════════════════════════════════════════════════

    #[test]
    fn test_repeated_runs_are_identical() {
        let first = run("input.js", NESTED_CLOSURE);
        let second = run("input.js", NESTED_CLOSURE);
        assert_eq!(first, second);
    }

    #[test]
    fn test_transformed_output_is_not_retagged() {
        let first = run("input.js", NESTED_CLOSURE);
        let second = run("input.js", &first.code);
        assert_eq!(second.code, first.code);
        assert!(second.records.is_empty());
        assert_eq!(extract_manifest_annotation(&second.code), Some(first.manifest));
    }

    #[test]
    fn test_hashbang_and_prologue_are_preserved() {
        let source = "#!/usr/bin/env node\n\"use strict\";\nexport async function job() { \"use step\"; }\n";
        let code = run("input.js", source).code;
        assert!(code.starts_with("#!/usr/bin/env node\n/**__internal_workflows"));
        let strict = position(&code, "\"use strict\";");
        let import = position(&code, "import { registerStepFunction }");
        assert!(strict < import);
    }
}
