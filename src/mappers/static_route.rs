use super::{check_name, check_prefix, check_text, mismatch, quote, MapperTable};
use crate::error::{CoreError, CoreResult};
use crate::models::{CommandModel, Operation, StaticRoute, StaticRouteIntent};

pub fn base() -> MapperTable {
    MapperTable::new()
        .with(Operation::AddRoute, add_route)
        .with(Operation::RemoveRoute, remove_route)
}

/// VyOS 1.3 keeps interface routes in a separate `interface-route` tree
pub fn v1_3() -> MapperTable {
    MapperTable::new().with(Operation::AddRoute, add_route_v1_3)
}

fn route_node(ipv6: bool) -> &'static str {
    if ipv6 {
        "route6"
    } else {
        "route"
    }
}

fn intent(model: &CommandModel, op: Operation) -> CoreResult<&StaticRouteIntent> {
    match model {
        CommandModel::StaticRoute(intent) => Ok(intent),
        other => Err(mismatch(other, op)),
    }
}

fn add_route(model: &CommandModel) -> CoreResult<Vec<String>> {
    let StaticRouteIntent::AddRoute(route) = intent(model, Operation::AddRoute)? else {
        return Err(mismatch(model, Operation::AddRoute));
    };
    let root = format!(
        "set protocols static {} {}",
        route_node(route.is_ipv6()),
        route.prefix
    );
    render_route(route, |iface| format!("{} interface {}", root, iface))
}

fn add_route_v1_3(model: &CommandModel) -> CoreResult<Vec<String>> {
    let StaticRouteIntent::AddRoute(route) = intent(model, Operation::AddRoute)? else {
        return Err(mismatch(model, Operation::AddRoute));
    };
    let tree = if route.is_ipv6() {
        "interface-route6"
    } else {
        "interface-route"
    };
    render_route(route, |iface| {
        format!(
            "set protocols static {} {} next-hop-interface {}",
            tree, route.prefix, iface
        )
    })
}

fn remove_route(model: &CommandModel) -> CoreResult<Vec<String>> {
    let StaticRouteIntent::RemoveRoute { prefix } = intent(model, Operation::RemoveRoute)? else {
        return Err(mismatch(model, Operation::RemoveRoute));
    };
    check_prefix(prefix)?;
    Ok(vec![format!(
        "delete protocols static {} {}",
        route_node(prefix.contains(':')),
        prefix
    )])
}

fn render_route(
    route: &StaticRoute,
    interface_command: impl Fn(&str) -> String,
) -> CoreResult<Vec<String>> {
    check_prefix(&route.prefix)?;
    if route.next_hops.is_empty() && route.interfaces.is_empty() && !route.blackhole {
        return Err(CoreError::invalid(format!(
            "static route {} needs a next-hop, interface or blackhole",
            route.prefix
        )));
    }
    if route.blackhole && !(route.next_hops.is_empty() && route.interfaces.is_empty()) {
        return Err(CoreError::invalid(format!(
            "static route {} cannot combine blackhole with forwarding targets",
            route.prefix
        )));
    }

    let root = format!(
        "set protocols static {} {}",
        route_node(route.is_ipv6()),
        route.prefix
    );
    let mut commands = Vec::new();

    for hop in &route.next_hops {
        check_name("next-hop", &hop.address)?;
        match hop.distance.or(route.distance) {
            Some(distance) => commands.push(format!(
                "{} next-hop {} distance {}",
                root,
                hop.address,
                quote(distance)
            )),
            None => commands.push(format!("{} next-hop {}", root, hop.address)),
        }
    }
    for iface in &route.interfaces {
        check_name("interface", iface)?;
        commands.push(interface_command(iface));
    }
    if route.blackhole {
        match route.distance {
            Some(distance) => {
                commands.push(format!("{} blackhole distance {}", root, quote(distance)))
            }
            None => commands.push(format!("{} blackhole", root)),
        }
    }
    if let Some(description) = &route.description {
        check_text("description", description)?;
        commands.push(format!("{} description {}", root, quote(description)));
    }

    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NextHop;

    fn route() -> StaticRoute {
        StaticRoute {
            prefix: "10.10.0.0/16".into(),
            next_hops: vec![
                NextHop {
                    address: "192.0.2.1".into(),
                    distance: None,
                },
                NextHop {
                    address: "192.0.2.2".into(),
                    distance: Some(20),
                },
            ],
            interfaces: vec!["wg0".into()],
            blackhole: false,
            distance: None,
            description: Some("lab uplinks".into()),
        }
    }

    fn model(route: StaticRoute) -> CommandModel {
        CommandModel::StaticRoute(StaticRouteIntent::AddRoute(route))
    }

    #[test]
    fn test_add_route_base_syntax() {
        assert_eq!(
            add_route(&model(route())).unwrap(),
            vec![
                "set protocols static route 10.10.0.0/16 next-hop 192.0.2.1",
                "set protocols static route 10.10.0.0/16 next-hop 192.0.2.2 distance '20'",
                "set protocols static route 10.10.0.0/16 interface wg0",
                "set protocols static route 10.10.0.0/16 description 'lab uplinks'",
            ]
        );
    }

    #[test]
    fn test_add_route_v1_3_interface_tree() {
        let commands = add_route_v1_3(&model(route())).unwrap();
        assert_eq!(
            commands[2],
            "set protocols static interface-route 10.10.0.0/16 next-hop-interface wg0"
        );
        assert_eq!(
            commands[0],
            "set protocols static route 10.10.0.0/16 next-hop 192.0.2.1"
        );
    }

    #[test]
    fn test_ipv6_blackhole() {
        let r = StaticRoute {
            prefix: "2001:db8:dead::/48".into(),
            next_hops: vec![],
            interfaces: vec![],
            blackhole: true,
            distance: Some(250),
            description: None,
        };
        assert_eq!(
            add_route(&model(r)).unwrap(),
            vec!["set protocols static route6 2001:db8:dead::/48 blackhole distance '250'"]
        );
    }

    #[test]
    fn test_route_target_validation() {
        let mut r = route();
        r.next_hops.clear();
        r.interfaces.clear();
        assert!(add_route(&model(r.clone())).is_err());

        r.blackhole = true;
        r.interfaces.push("eth0".into());
        assert!(add_route(&model(r)).is_err());
    }

    #[test]
    fn test_remove_route() {
        let remove = CommandModel::StaticRoute(StaticRouteIntent::RemoveRoute {
            prefix: "2001:db8::/32".into(),
        });
        assert_eq!(
            remove_route(&remove).unwrap(),
            vec!["delete protocols static route6 2001:db8::/32"]
        );
    }
}
