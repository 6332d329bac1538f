// functions.rs — FUNCTION and PROCEDURE emission
//
// Prototypes, bodies with a `ret_{name}` return variable, and TABLE support:
// the raw `f_{name}` routine, the `check_{name}` table builder and the
// replacement routine that interpolates linearly between table points.
//
// Preconditions: every callable with a table has exactly one (checked by
//                `model::build`).
// Postconditions: a tabulated routine keeps its public name; callers never
//                 see `f_{name}`.
// Failure modes: propagates statement emission errors (E0109 ...).
// Side effects: appends to the session printer only.

use crate::diag::Diagnostic;
use crate::emit::{Session, INTERNAL_ARGS};
use crate::model::{Callable, Table};
use crate::resolve::{EmissionContext, Style};

/// Parameters of `check_table_thread_{suffix}`, as the runtime calls it.
pub const TABLE_THREAD_PARAMS: &str = "int id, int pnodecount, double* data, Datum* indexes, ThreadDatum* thread, NrnThread* nt, Memb_list* ml, int tml_id";

impl<'a> Session<'a> {
    fn return_type(callable: &Callable) -> &'static str {
        if callable.is_function {
            "double"
        } else {
            "int"
        }
    }

    /// `inline double name_suffix(internal params, double a, ...)`
    fn routine_declaration(&self, callable: &Callable, name: &str) -> String {
        let mut params = self.internal_params();
        for param in &callable.params {
            params.push_str(", double ");
            params.push_str(param);
        }
        format!(
            "{}{} {}({})",
            self.backend.function_qualifier(),
            Self::return_type(callable),
            self.method_name(name),
            params
        )
    }

    pub fn print_function_prototypes(&mut self, callables: &[&Callable]) {
        if callables.is_empty() {
            return;
        }
        self.p.add_newlines(2);
        for callable in callables {
            let line = format!("{};", self.routine_declaration(callable, &callable.name));
            self.p.add_line(line);
        }
    }

    /// A routine, or for tabulated ones the raw routine plus its table
    /// builder and replacement.
    pub fn print_callable(&mut self, callable: &Callable) -> Result<(), Diagnostic> {
        match &callable.table {
            Some(table) => {
                let raw = format!("f_{}", callable.name);
                self.print_routine(callable, &raw)?;
                self.print_table_check(callable, table)?;
                self.print_table_replacement(callable, table);
                Ok(())
            }
            None => self.print_routine(callable, &callable.name),
        }
    }

    fn print_routine(&mut self, callable: &Callable, name: &str) -> Result<(), Diagnostic> {
        let ret = format!("ret_{}", name);
        self.p.add_newlines(2);
        let declaration = self.routine_declaration(callable, name);
        self.p.push_block(declaration);
        if callable.is_function {
            self.p.add_line(format!("double {} = 0.0;", ret));
        } else {
            self.p.add_line(format!("int {} = 0;", ret));
        }
        if self.resolver.style() == Style::Neuron && !self.metadata.artificial_cell {
            self.p
                .add_line("auto v = node_data.node_voltages[node_data.nodeindices[id]];");
        }
        // the routine name assigns the return value; parameters shadow model variables
        let mut scope: Vec<(String, String)> = callable
            .params
            .iter()
            .map(|p| (p.clone(), p.clone()))
            .collect();
        scope.push((callable.name.clone(), ret.clone()));
        let ctx = EmissionContext::routine();
        self.with_scope(scope, |s| s.block(&callable.body, &ctx))?;
        self.p.add_line(format!("return {};", ret));
        self.p.pop_block();
        Ok(())
    }

    fn table_storage(&self, var: &str, ctx: &EmissionContext<'_>) -> (String, Option<usize>) {
        let length = self
            .metadata
            .lookup(var)
            .filter(|s| s.is_array)
            .map(|s| s.length);
        (self.name(&format!("t_{}", var), ctx), length)
    }

    fn print_table_check(&mut self, callable: &Callable, table: &Table) -> Result<(), Diagnostic> {
        let ctx = EmissionContext::routine();
        let name = &callable.name;
        let use_table = self.name("usetable", &ctx);
        let tmin = self.name(&format!("tmin_{}", name), &ctx);
        let mfac = self.name(&format!("mfac_{}", name), &ctx);
        let from = self.expr(&table.from, &ctx)?;
        let to = self.expr(&table.to, &ctx)?;
        let with = table.with;

        self.p.add_newlines(2);
        self.p.push_block(format!(
            "{}void check_{}({})",
            self.backend.function_qualifier(),
            self.method_name(name),
            self.internal_params()
        ));
        self.p.push_block(format!("if ({} == 0)", use_table));
        self.p.add_line("return;");
        self.p.pop_block();
        self.p.add_line("static bool make_table = true;");
        for dep in &table.depend {
            self.p.add_line(format!("static double save_{};", dep));
        }
        for dep in &table.depend {
            let current = self.name(dep, &ctx);
            self.p.push_block(format!("if (save_{} != {})", dep, current));
            self.p.add_line("make_table = true;");
            self.p.pop_block();
        }
        self.p.push_block("if (make_table)");
        self.p.add_line("make_table = false;");
        self.p.add_line(format!("{} = {};", tmin, from));
        self.p.add_line(format!("double tmax = {};", to));
        self.p.add_line(format!("double dx = (tmax-{}) / {}.;", tmin, with));
        self.p.add_line(format!("{} = 1./dx;", mfac));
        self.p.add_line(format!("double x = {};", tmin));
        self.p.push_block(format!(
            "for (std::size_t i = 0; i < {}; x += dx, i++)",
            with + 1
        ));
        let raw = self.method_name(&format!("f_{}", name));
        if callable.is_function {
            let (storage, _) = self.table_storage(name, &ctx);
            self.p
                .add_line(format!("{}[i] = {}({}, x);", storage, raw, self.internal_args()));
        } else {
            self.p.add_line(format!("{}({}, x);", raw, self.internal_args()));
            for var in &table.vars {
                let value = self.name(var, &ctx);
                match self.table_storage(var, &ctx) {
                    (storage, Some(length)) => {
                        for j in 0..length {
                            self.p
                                .add_line(format!("{}[{}][i] = {}[{}];", storage, j, value, j));
                        }
                    }
                    (storage, None) => self.p.add_line(format!("{}[i] = {};", storage, value)),
                }
            }
        }
        self.p.pop_block();
        for dep in &table.depend {
            let current = self.name(dep, &ctx);
            self.p.add_line(format!("save_{} = {};", dep, current));
        }
        self.p.pop_block();
        self.p.pop_block();
        Ok(())
    }

    fn print_table_replacement(&mut self, callable: &Callable, table: &Table) {
        let ctx = EmissionContext::routine();
        let name = &callable.name;
        let use_table = self.name("usetable", &ctx);
        let tmin = self.name(&format!("tmin_{}", name), &ctx);
        let mfac = self.name(&format!("mfac_{}", name), &ctx);
        let raw = self.method_name(&format!("f_{}", name));
        let arg = callable.params.first().map(String::as_str).unwrap_or("x");
        let with = table.with;
        // (instance value, table storage, array length)
        let targets: Vec<(String, String, Option<usize>)> = table
            .vars
            .iter()
            .map(|var| {
                let (storage, length) = self.table_storage(var, &ctx);
                (self.name(var, &ctx), storage, length)
            })
            .collect();

        self.p.add_newlines(2);
        let declaration = self.routine_declaration(callable, name);
        self.p.push_block(declaration);

        self.p.push_block(format!("if ({} == 0)", use_table));
        if callable.is_function {
            self.p
                .add_line(format!("return {}({}, {});", raw, self.internal_args(), arg));
        } else {
            self.p.add_line(format!("{}({}, {});", raw, self.internal_args(), arg));
            self.p.add_line("return 0;");
        }
        self.p.pop_block();

        self.p
            .add_line(format!("double xi = {} * ({} - {});", mfac, arg, tmin));
        self.p.push_block("if (isnan(xi))");
        if callable.is_function {
            self.p.add_line("return xi;");
        } else {
            for (value, _, length) in &targets {
                match length {
                    Some(n) => (0..*n).for_each(|j| self.p.add_line(format!("{}[{}] = xi;", value, j))),
                    None => self.p.add_line(format!("{} = xi;", value)),
                }
            }
            self.p.add_line("return 0;");
        }
        self.p.pop_block();

        self.p.push_block(format!("if (xi <= 0. || xi >= {}.)", with));
        self.p
            .add_line(format!("int index = (xi <= 0.) ? 0 : {};", with));
        if callable.is_function {
            let (storage, _) = self.table_storage(name, &ctx);
            self.p.add_line(format!("return {}[index];", storage));
        } else {
            for (value, storage, length) in &targets {
                match length {
                    Some(n) => (0..*n).for_each(|j| {
                        self.p
                            .add_line(format!("{}[{}] = {}[{}][index];", value, j, storage, j))
                    }),
                    None => self.p.add_line(format!("{} = {}[index];", value, storage)),
                }
            }
            self.p.add_line("return 0;");
        }
        self.p.pop_block();

        self.p.add_line("int i = int(xi);");
        self.p.add_line("double theta = xi - double(i);");
        if callable.is_function {
            let (storage, _) = self.table_storage(name, &ctx);
            self.p.add_line(format!(
                "return {0}[i] + theta * ({0}[i+1] - {0}[i]);",
                storage
            ));
        } else {
            for (value, storage, length) in &targets {
                match length {
                    Some(n) => (0..*n).for_each(|j| {
                        self.p.add_line(format!(
                            "{0}[{1}] = {2}[{1}][i] + theta*({2}[{1}][i+1]-{2}[{1}][i]);",
                            value, j, storage
                        ))
                    }),
                    None => self.p.add_line(format!(
                        "{0} = {1}[i] + theta*({1}[i+1]-{1}[i]);",
                        value, storage
                    )),
                }
            }
            self.p.add_line("return 0;");
        }
        self.p.pop_block();
    }

    /// Rebuilds every table once per thread before a time step.
    pub fn print_check_table_thread(&mut self) {
        if self.metadata.table_count() == 0 {
            return;
        }
        self.p.add_newlines(2);
        self.p.push_block(format!(
            "static void {} ({})",
            self.method_name("check_table_thread"),
            TABLE_THREAD_PARAMS
        ));
        self.p.add_line("setup_instance(nt, ml);");
        self.p.add_line(format!(
            "auto* const inst = static_cast<{}*>(ml->instance);",
            self.instance_struct()
        ));
        self.p.add_line("double v = 0;");
        let names: Vec<String> = self
            .metadata
            .functions_with_table()
            .map(|c| format!("check_{}", self.method_name(&c.name)))
            .collect();
        for name in names {
            self.p.add_line(format!("{}({});", name, INTERNAL_ARGS));
        }
        self.p.pop_block();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendPolicy, CppBackend};
    use crate::calls::classify;
    use crate::layout;
    use crate::model::{build, ModelFile};
    use crate::resolve::{Resolver, Style};

    fn render(json: &str, backend: &dyn BackendPolicy, f: impl FnOnce(&mut Session<'_>)) -> String {
        let file: ModelFile = serde_json::from_str(json).expect("model json");
        let metadata = build(&file).expect("valid model");
        let plan = layout::plan(&metadata);
        let calls = classify(&metadata);
        let resolver = Resolver::new(&metadata, &plan, Style::Coreneuron).expect("resolver");
        let mut s = Session::new(&metadata, &plan, &calls, &resolver, backend);
        f(&mut s);
        s.finish()
    }

    const RATES: &str = r#"{
        "mod_file": "k", "suffix": "k",
        "variables": [
            {"name": "ninf", "kinds": ["range", "assigned"]},
            {"name": "n", "kinds": ["state"]}
        ],
        "neuron_globals": ["celsius"],
        "blocks": {
            "initial": "rates(v) n = ninf",
            "procedures": [{
                "name": "rates", "params": ["v"],
                "body": "ninf = alpha(v) / 2",
                "table": {"vars": ["ninf"], "depend": ["celsius"], "from": "-100", "to": "100", "with": 200}
            }],
            "functions": [{"name": "alpha", "params": ["x"], "body": "alpha = exp(-x / 10)"}]
        }
    }"#;

    #[test]
    fn function_assigns_return_variable() {
        let text = render(RATES, &CppBackend, |s| {
            let m = s.metadata;
            let alpha = m.callable("alpha").expect("alpha");
            s.print_callable(alpha).expect("emit");
        });
        assert!(text.contains("inline double alpha_k(int id, int pnodecount, k_Instance* inst,"));
        assert!(text.contains(", double x) {\n    double ret_alpha = 0.0;\n"));
        assert!(text.contains("    ret_alpha = exp(-x / 10);\n    return ret_alpha;\n}"));
    }

    #[test]
    fn tabulated_procedure_gets_raw_check_and_replacement() {
        let text = render(RATES, &CppBackend, |s| {
            let m = s.metadata;
            s.print_callable(m.callable("rates").expect("rates")).expect("emit");
        });
        assert!(text.contains("inline int f_rates_k("));
        assert!(text.contains("    int ret_f_rates = 0;\n"));
        assert!(text.contains("inline void check_rates_k("));
        assert!(text.contains("static double save_celsius;"));
        assert!(text.contains("if (save_celsius != *(inst->celsius)) {"));
        assert!(text.contains("double dx = (tmax-inst->global->tmin_rates) / 200.;"));
        assert!(text.contains("for (std::size_t i = 0; i < 201; x += dx, i++) {"));
        assert!(text.contains("inst->global->t_ninf[i] = inst->ninf[id];"));
        assert!(text.contains("inline int rates_k("));
        assert!(text.contains("f_rates_k(id, pnodecount, inst, data, indexes, thread, nt, v, v);"));
        assert!(text.contains("double xi = inst->global->mfac_rates * (v - inst->global->tmin_rates);"));
        assert!(text.contains(
            "inst->ninf[id] = inst->global->t_ninf[i] + theta*(inst->global->t_ninf[i+1]-inst->global->t_ninf[i]);"
        ));
    }

    #[test]
    fn prototypes_and_table_thread_check() {
        let text = render(RATES, &CppBackend, |s| {
            let m = s.metadata;
            let all: Vec<&Callable> = m.functions.iter().chain(&m.procedures).collect();
            s.print_function_prototypes(&all);
            s.print_check_table_thread();
        });
        assert!(text.contains("inline double alpha_k("));
        assert!(text.contains(", double x);\n"));
        assert!(text.contains("static void check_table_thread_k (int id, int pnodecount,"));
        assert!(text.contains("    check_rates_k(id, pnodecount, inst, data, indexes, thread, nt, v);\n"));
    }
}
