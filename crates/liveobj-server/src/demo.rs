//! Demo object model served by the binary: a `Thing` owned by a `Person`,
//! pinned as "testobj", firing `tick` every second.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use liveobj_core::{
    Object, Properties, ReferencePolicy, Registry, RemoteMap, RemoteObject, Result, Server,
    Timestamp, Value,
};
use tracing::{debug, info, warn};

pub const TEST_OBJECT_NAME: &str = "testobj";
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub struct Person {
    name: String,
    age: u32,
}

impl Person {
    pub fn new(name: &str, age: u32) -> Self {
        Self {
            name: name.to_string(),
            age,
        }
    }
}

impl RemoteObject for Person {
    fn properties(&self) -> Properties {
        Properties::from([
            ("name".to_string(), Value::from(self.name.as_str())),
            ("age".to_string(), Value::from(self.age)),
        ])
    }
}

pub struct Thing {
    color: RwLock<String>,
    size: f64,
    owner: Object,
}

impl Thing {
    pub fn new(color: &str, size: f64, owner: Person) -> Self {
        Self {
            color: RwLock::new(color.to_string()),
            size,
            owner: Object::new(owner),
        }
    }

    fn color(&self) -> String {
        self.color.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn speak(&self, greeting: &str) -> String {
        let said = format!("{}, my color is {}", greeting, self.color());
        info!("{}", said);
        said
    }
}

impl RemoteObject for Thing {
    fn properties(&self) -> Properties {
        Properties::from([
            ("color".to_string(), Value::from(self.color())),
            ("size".to_string(), Value::from(self.size)),
            ("owner".to_string(), Value::Object(self.owner.clone())),
        ])
    }
}

fn describe(value: &Value) -> String {
    match value.as_object() {
        Some(object) => match object.downcast_ref::<RemoteMap>() {
            Some(map) => {
                let entries: Vec<String> = map
                    .entries()
                    .iter()
                    .map(|(k, v)| format!("{:?} => {:?}", k, v))
                    .collect();
                format!("Map {{{}}}", entries.join(", "))
            }
            None => match object.downcast_ref::<Timestamp>() {
                Some(ts) => ts.to_iso(),
                None => format!("{:?}", object.properties()),
            },
        },
        None => format!("{:?}", value),
    }
}

/// Registry with the demo types, their methods and the root `sum` function.
pub fn registry() -> Result<Registry> {
    let mut registry = Registry::new();
    registry.register_type::<Person>("Person", ReferencePolicy::RefWithSnapshot)?;
    registry.register_type::<Thing>("Thing", ReferencePolicy::RefWithSnapshot)?;

    registry.register_method::<Person, _>("greet", |person, _args| {
        Ok(Value::from(format!("Hello, {}", person.name)))
    })?;
    registry.register_client_method::<Person>(
        "describe",
        &[],
        "this.name + ' is ' + this.age + ' years old'",
    )?;

    registry.register_method::<Thing, _>("speak", |thing, args| {
        Ok(Value::from(thing.speak(args.str(0)?)))
    })?;
    registry.register_method::<Thing, _>("print", |_thing, args| {
        info!("print: {}", describe(args.get(0)));
        Ok(Value::Null)
    })?;
    registry.register_method::<Thing, _>("getMap", |thing, _args| {
        let mut map = RemoteMap::new();
        map.insert(55, "qué tal");
        map.insert(
            4,
            Value::Map(Properties::from([("color".to_string(), Value::from(thing.color()))])),
        );
        Ok(Value::Object(Object::new(map)))
    })?;
    registry.register_method::<Thing, _>("setColor", |thing, args| {
        *thing.color.write().unwrap_or_else(|e| e.into_inner()) = args.str(0)?.to_string();
        Ok(Value::Null)
    })?;
    registry.register_client_method::<Thing>("area", &[], "this.size * this.size")?;

    registry.register_function("sum", |args| Ok(Value::from(args.f64(0)? + args.f64(1)?)))?;
    Ok(registry)
}

/// Pin the demo `Thing` as "testobj" and return it.
pub fn populate(server: &Server) -> Arc<Thing> {
    let thing = Arc::new(Thing::new("blue", 4.0, Person::new("Jay", 37)));
    server.register_object(&Object::from_arc(thing.clone()), TEST_OBJECT_NAME);
    thing
}

/// Fire `tick` with the current time on `thing` until the server shuts down.
pub async fn tick(server: Server, thing: Arc<Thing>) {
    let object = Object::from_arc(thing);
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    loop {
        interval.tick().await;
        if server.is_shut_down() {
            break;
        }
        let now = Value::Object(Object::new(Timestamp::now()));
        match server.fire_event(&object, "tick", vec![now]) {
            Ok(0) => {}
            Ok(n) => debug!("tick delivered to {} connections", n),
            Err(e) => warn!("tick failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liveobj_core::ServerOptions;

    #[test]
    fn test_demo_registry() {
        let registry = registry().unwrap();
        let thing = registry.descriptor("Thing").unwrap();
        assert!(thing.method("speak").is_some());
        assert!(thing.method("getMap").is_some());
        assert!(registry.descriptor("Root").unwrap().method("sum").is_some());
        let info = registry.describe("Person").unwrap();
        assert!(info.client_methods.contains_key("describe"));
    }

    #[tokio::test]
    async fn test_populate_pins_testobj() {
        let server = Server::new(registry().unwrap(), ServerOptions::default());
        let thing = populate(&server);
        let named = server.named(TEST_OBJECT_NAME).unwrap();
        assert!(named.ptr_eq(&Object::from_arc(thing.clone())));
        assert_eq!(thing.speak("hi"), "hi, my color is blue");
    }
}
