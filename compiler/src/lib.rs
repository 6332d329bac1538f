// mcc — mechanism code compiler
//
// Library root. Turns an analyzed NMODL model into simulator kernels for
// CoreNEURON (C++, OpenACC, CUDA, ISPC) and NEURON.

pub mod ast;
pub mod backend;
pub mod calls;
pub mod codegen;
pub mod diag;
pub mod emit;
pub mod events;
pub mod functions;
pub mod kernels;
pub mod layout;
pub mod lexer;
pub mod model;
pub mod neuron;
pub mod parser;
pub mod pass;
pub mod pipeline;
pub mod printer;
pub mod register;
pub mod resolve;
pub mod solver;
pub mod structs;
