//! Ops, classes and instances every compiler starts with.

use kiln_codegen::builtin_ops;
use kiln_common::{ClassDecl, Expr, InstanceDecl, Ty};

use crate::compiler::Compiler;
use crate::error::CompileError;

fn a() -> Ty {
    Ty::con("a")
}

fn binary(result: Ty) -> Ty {
    Ty::fun(vec![a(), a()], result)
}

fn class(name: &str, params: &[&str], members: Vec<(&str, Ty)>) -> ClassDecl {
    ClassDecl {
        name: name.into(),
        params: params.iter().map(|p| p.to_string()).collect(),
        members: members.into_iter().map(|(m, t)| (m.to_string(), t)).collect(),
    }
}

fn instance(class: &str, args: Vec<Ty>, members: &[(&str, &str)]) -> InstanceDecl {
    InstanceDecl::ground(
        class,
        args,
        members
            .iter()
            .map(|(member, op)| (member.to_string(), Expr::var(*op)))
            .collect(),
    )
}

pub(crate) fn install(c: &mut Compiler) -> Result<(), CompileError> {
    for op in builtin_ops() {
        let name = op.name().to_string();
        c.bind_ll_func(&name, op)?;
    }

    c.define_class(class("Eq", &["a"], vec![("==", binary(Ty::bool()))]))?;
    c.define_class(class(
        "Ord",
        &["a"],
        vec![("<", binary(Ty::bool())), ("<=", binary(Ty::bool()))],
    ))?;
    for (name, member) in [("Add", "+"), ("Sub", "-"), ("Mul", "*"), ("Div", "/")] {
        c.define_class(class(name, &["a"], vec![(member, binary(a()))]))?;
    }
    c.define_class(class("Neg", &["a"], vec![("neg", Ty::fun(vec![a()], a()))]))?;
    c.define_class(class(
        "Convert",
        &["a", "b"],
        vec![("convert", Ty::fun(vec![a()], Ty::con("b")))],
    ))?;

    for (prefix, ty) in [
        ("int", Ty::int()),
        ("float", Ty::float()),
        ("char", Ty::char()),
        ("bool", Ty::bool()),
    ] {
        let eq = format!("{}_eq", prefix);
        let lt = format!("{}_lt", prefix);
        let le = format!("{}_le", prefix);
        c.add_instance(instance("Eq", vec![ty.clone()], &[("==", eq.as_str())]))?;
        c.add_instance(instance("Ord", vec![ty], &[("<", lt.as_str()), ("<=", le.as_str())]))?;
    }
    for (prefix, ty) in [("int", Ty::int()), ("float", Ty::float())] {
        for (class, member, op) in [
            ("Add", "+", "add"),
            ("Sub", "-", "sub"),
            ("Mul", "*", "mul"),
            ("Div", "/", "div"),
            ("Neg", "neg", "neg"),
        ] {
            let op = format!("{}_{}", prefix, op);
            c.add_instance(instance(class, vec![ty.clone()], &[(member, op.as_str())]))?;
        }
    }
    c.add_instance(instance("Convert", vec![Ty::int(), Ty::float()], &[("convert", "toFloat")]))?;
    c.add_instance(instance("Convert", vec![Ty::float(), Ty::int()], &[("convert", "toInt")]))?;
    c.add_instance(instance("Convert", vec![Ty::char(), Ty::int()], &[("convert", "ord")]))?;
    Ok(())
}
