// solver.rs — derivimplicit Newton solve
//
// For every DERIVATIVE block solved with derivimplicit: a functor computing
// the residual of backward Euler and the `{block}_{suffix}` wrapper that
// saves the states and hands the functor to `nrn_newton_thread`.
//
// Preconditions: the thread layout reserves the derivimplicit slots.
// Postconditions: the residual is `D - (x - x_saved)/dt` while advancing,
//                 `x - x_saved` otherwise.
// Failure modes: propagates statement emission errors.
// Side effects: appends to the session printer only.

use crate::backend::BlockType;
use crate::diag::Diagnostic;
use crate::emit::{Session, EXTERNAL_ARGS, EXTERNAL_PARAMS};
use crate::model::DerivBlock;
use crate::resolve::EmissionContext;

const STRIDE: &str = "*pnodecount+id";

impl<'a> Session<'a> {
    pub fn print_derivimplicit_kernel(&mut self, block: &DerivBlock) -> Result<(), Diagnostic> {
        let m = self.metadata;
        let list = self.plan.thread.derivimplicit_list_num;
        let next = list + 1;
        let suffix = self.suffix().to_string();
        let primes: usize = m.prime_variables.iter().map(|p| p.length).sum();
        let num_primes = m.prime_variables.len();
        let ctx = EmissionContext::kernel(BlockType::State);

        let instance = format!(
            "auto* const inst = static_cast<{}*>(ml->instance);",
            self.instance_struct()
        );
        let slist = format!("auto const& slist{} = {};", list, self.name(&format!("slist{}", list), &ctx));
        let slist_next = format!("auto& slist{} = {};", next, self.name(&format!("slist{}", next), &ctx));
        let dlist = format!("auto const& dlist{} = {};", list, self.name(&format!("dlist{}", list), &ctx));
        let dlist_next = format!(
            "double* dlist{} = static_cast<double*>(thread[dith{}()].pval) + ({}*pnodecount);",
            next, list, primes
        );

        self.p.add_newlines(2);
        self.p.push_block("namespace");
        self.p.push_block(format!("struct _newton_{}_{}", block.name, suffix));
        self.p
            .push_block(format!("int operator()({}) const", EXTERNAL_PARAMS));
        self.p.add_line(instance.clone());
        self.p.add_line(format!(
            "double* savstate{} = static_cast<double*>(thread[dith{}()].pval);",
            list, list
        ));
        self.p.add_line(slist.clone());
        self.p.add_line(dlist);
        self.p.add_line(dlist_next.clone());
        self.block(&block.body, &ctx)?;
        self.p.add_line("int counter = -1;");
        self.p.push_block(format!("for (int i=0; i<{}; i++)", num_primes));
        self.p
            .push_block(format!("if (*deriv{}_advance(thread))", list));
        self.p.add_line(format!(
            "dlist{0}[(++counter){1}] = data[dlist{2}[i]{1}]-(data[slist{2}[i]{1}]-savstate{2}[i{1}])/nt->_dt;",
            next, STRIDE, list
        ));
        self.p.chain_block("else");
        self.p.add_line(format!(
            "dlist{0}[(++counter){1}] = data[slist{2}[i]{1}]-savstate{2}[i{1}];",
            next, STRIDE, list
        ));
        self.p.pop_block();
        self.p.pop_block();
        self.p.add_line("return 0;");
        self.p.pop_block();
        self.p.pop_block_with(";");
        self.p.pop_block();

        self.p.add_newline();
        self.p.push_block(format!(
            "int {}({})",
            self.method_name(&block.name),
            EXTERNAL_PARAMS
        ));
        self.p.add_line(instance);
        self.p.add_line(format!(
            "double* savstate{} = (double*) thread[dith{}()].pval;",
            list, list
        ));
        self.p.add_line(slist);
        self.p.add_line(slist_next);
        self.p.add_line(dlist_next);
        self.p.push_block(format!("for (int i=0; i<{}; i++)", num_primes));
        self.p.add_line(format!(
            "savstate{}[i{}] = data[slist{}[i]{}];",
            list, STRIDE, list, STRIDE
        ));
        self.p.pop_block();
        self.p.add_line(format!(
            "int reset = nrn_newton_thread(static_cast<NewtonSpace*>(*newtonspace{}(thread)), {}, slist{}, _newton_{}_{}{{}}, dlist{}, {});",
            list, primes, next, block.name, suffix, next, EXTERNAL_ARGS
        ));
        self.p.add_line("return reset;");
        self.p.pop_block();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CppBackend;
    use crate::calls::classify;
    use crate::layout;
    use crate::model::{build, ModelFile};
    use crate::resolve::{Resolver, Style};

    const CADYN: &str = r#"{
        "mod_file": "cadyn", "suffix": "cad",
        "thread_safe": true, "vectorize": true,
        "variables": [
            {"name": "cai", "kinds": ["state"]},
            {"name": "taur", "kinds": ["range", "parameter"], "value": 200},
            {"name": "cainf", "kinds": ["range", "parameter"], "value": 0.0001}
        ],
        "solves": [{"block": "states", "method": "derivimplicit"}],
        "blocks": {
            "state": "DERIVIMPLICIT states",
            "derivimplicit": [{"name": "states", "body": "Dcai = (cainf - cai)/taur"}]
        }
    }"#;

    fn render() -> String {
        let file: ModelFile = serde_json::from_str(CADYN).expect("model json");
        let metadata = build(&file).expect("valid model");
        let plan = layout::plan(&metadata);
        let calls = classify(&metadata);
        let resolver = Resolver::new(&metadata, &plan, Style::Coreneuron).expect("resolver");
        let mut s = Session::new(&metadata, &plan, &calls, &resolver, &CppBackend);
        let block = metadata.derivimplicit_blocks[0].clone();
        s.print_derivimplicit_kernel(&block).expect("emit");
        s.finish()
    }

    #[test]
    fn functor_residual_depends_on_advance_flag() {
        let text = render();
        assert!(text.contains("namespace {\n    struct _newton_states_cad {\n"));
        assert!(text.contains("        int operator()(int id, int pnodecount, double* data, Datum* indexes, ThreadDatum* thread, NrnThread* nt, Memb_list* ml, double v) const {\n"));
        assert!(text.contains("if (*deriv1_advance(thread)) {"));
        assert!(text.contains(
            "dlist2[(++counter)*pnodecount+id] = data[dlist1[i]*pnodecount+id]-(data[slist1[i]*pnodecount+id]-savstate1[i*pnodecount+id])/nt->_dt;"
        ));
        assert!(text.contains("dlist2[(++counter)*pnodecount+id] = data[slist1[i]*pnodecount+id]-savstate1[i*pnodecount+id];"));
        assert!(text.contains("    };\n}\n"));
    }

    #[test]
    fn wrapper_saves_states_and_calls_newton() {
        let text = render();
        assert!(text.contains("int states_cad(int id, int pnodecount, double* data, "));
        assert!(text.contains("auto const& slist1 = inst->global->slist1;"));
        assert!(text.contains("auto& slist2 = inst->global->slist2;"));
        assert!(text.contains("savstate1[i*pnodecount+id] = data[slist1[i]*pnodecount+id];"));
        assert!(text.contains(
            "int reset = nrn_newton_thread(static_cast<NewtonSpace*>(*newtonspace1(thread)), 1, slist2, _newton_states_cad{}, dlist2, id, pnodecount, data, indexes, thread, nt, ml, v);"
        ));
    }
}
