use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use freight_base::hashing::HashMap;

/// Marker heading an array-shaped external reference: `["@ext#", index]`.
pub const EXT_MARKER: &str = "@ext#";
/// Marker heading an array-shaped sub-object reference: `["@sub#", index]`.
pub const SUB_MARKER: &str = "@sub#";

/// A live engine-side object produced by the constructor table.
pub struct Constructed {
    pub type_name: String,
    pub data: Resolved,
}

impl fmt::Debug for Constructed {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Constructed")
            .field("type_name", &self.type_name)
            .field("data", &self.data)
            .finish()
    }
}

/// No-argument factory deferring instantiation of another composite scene.
/// Returns None when the referenced scene was never registered.
pub type SceneFactory = Rc<dyn Fn() -> Option<Rc<Constructed>>>;

/// A composite value with every tagged reference rewritten into a live link.
pub enum Resolved {
    Raw(Value),
    List(Vec<Resolved>),
    Map(Vec<(String, Resolved)>),
    /// Direct link to a constructed ext/sub table entry
    Link(Rc<Constructed>),
    /// Deferred link: a scene left unmaterialized until the factory runs,
    /// which is what keeps cyclic scene graphs finite
    Deferred(SceneFactory),
}

impl Resolved {
    pub fn as_raw(&self) -> Option<&Value> {
        match self {
            Resolved::Raw(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<&Rc<Constructed>> {
        match self {
            Resolved::Link(link) => Some(link),
            _ => None,
        }
    }

    pub fn as_deferred(&self) -> Option<&SceneFactory> {
        match self {
            Resolved::Deferred(factory) => Some(factory),
            _ => None,
        }
    }

    /// Map entry lookup by key.
    pub fn get(
        &self,
        key: &str,
    ) -> Option<&Resolved> {
        match self {
            Resolved::Map(entries) => entries
                .iter()
                .find(|(entry_key, _)| entry_key == key)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    /// List entry lookup by position.
    pub fn index(
        &self,
        index: usize,
    ) -> Option<&Resolved> {
        match self {
            Resolved::List(items) => items.get(index),
            _ => None,
        }
    }
}

impl fmt::Debug for Resolved {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Resolved::Raw(value) => write!(f, "Raw({})", value),
            Resolved::List(items) => f.debug_list().entries(items).finish(),
            Resolved::Map(entries) => f
                .debug_map()
                .entries(entries.iter().map(|(k, v)| (k, v)))
                .finish(),
            Resolved::Link(link) => write!(f, "Link({})", link.type_name),
            Resolved::Deferred(_) => write!(f, "Deferred(..)"),
        }
    }
}

/// One entry of a composite's external-reference table.
pub enum ExtEntry {
    Link(Rc<Constructed>),
    Factory(SceneFactory),
}

/// Ext/sub index tables of one composite, built by the sub-resource
/// construction pass and consumed by marker resolution.
#[derive(Default)]
pub struct RefTables {
    pub ext: Vec<ExtEntry>,
    pub sub: Vec<Rc<Constructed>>,
}

/// Builds one engine object from a type name and its resolved data.
pub type Constructor = fn(&str, Resolved) -> Constructed;

/// Type-name to constructor mapping with an explicit default case: unknown
/// type names become plain `Constructed` records rather than errors.
#[derive(Default)]
pub struct ConstructorTable {
    constructors: HashMap<String, Constructor>,
}

impl ConstructorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        type_name: &str,
        constructor: Constructor,
    ) -> &mut Self {
        self.constructors.insert(type_name.to_string(), constructor);
        self
    }

    fn construct(
        &self,
        type_name: &str,
        data: Resolved,
    ) -> Rc<Constructed> {
        match self.constructors.get(type_name) {
            Some(constructor) => Rc::new(constructor(type_name, data)),
            None => Rc::new(Constructed {
                type_name: type_name.to_string(),
                data,
            }),
        }
    }
}

/// Post-completion pass over loaded composite payloads.
///
/// A composite is an object of the shape
/// `{ "type": .., "ext": [..], "sub": [..], "data": .. }`. Construction
/// instantiates a typed object for every ext/sub index (threading the tables
/// recursively for nested composites), then resolution walks `data` and
/// replaces every `["@ext#", i]` / `["@sub#", i]` array with the
/// corresponding live entry. Ext descriptors carrying `"deferred": true`
/// route through a scene factory instead of eager construction.
#[derive(Clone)]
pub struct ReferenceResolver {
    table: Rc<ConstructorTable>,
    // Raw composite payloads by resource name, looked up lazily by deferred
    // scene factories
    scenes: Rc<RefCell<HashMap<String, Value>>>,
}

impl ReferenceResolver {
    pub fn new(table: ConstructorTable) -> Self {
        Self {
            table: Rc::new(table),
            scenes: Rc::new(RefCell::new(HashMap::default())),
        }
    }

    /// Makes a raw composite available to deferred scene factories.
    pub fn register_scene(
        &self,
        name: &str,
        value: Value,
    ) {
        self.scenes.borrow_mut().insert(name.to_string(), value);
    }

    /// Constructs a composite: builds its ext/sub tables, resolves its data
    /// against them and runs the constructor table.
    pub fn construct(
        &self,
        composite: &Value,
    ) -> Rc<Constructed> {
        let tables = self.build_tables(composite);
        let type_name = composite
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        let data = self.resolve(composite.get("data").unwrap_or(&Value::Null), &tables);
        self.table.construct(type_name, data)
    }

    /// Constructs a registered scene by name. Deferred factories call this
    /// when they are finally invoked.
    pub fn construct_scene(
        &self,
        name: &str,
    ) -> Option<Rc<Constructed>> {
        let value = self.scenes.borrow().get(name).cloned()?;
        Some(self.construct(&value))
    }

    fn build_tables(
        &self,
        composite: &Value,
    ) -> RefTables {
        let mut tables = RefTables::default();
        if let Some(ext) = composite.get("ext").and_then(Value::as_array) {
            for descriptor in ext {
                tables.ext.push(self.build_ext_entry(descriptor));
            }
        }
        if let Some(sub) = composite.get("sub").and_then(Value::as_array) {
            for descriptor in sub {
                // Sub entries see the full ext table and every earlier sub
                // entry, so embedded objects can reference their siblings
                let type_name = descriptor
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown");
                let data =
                    self.resolve(descriptor.get("data").unwrap_or(&Value::Null), &tables);
                tables.sub.push(self.table.construct(type_name, data));
            }
        }
        tables
    }

    fn build_ext_entry(
        &self,
        descriptor: &Value,
    ) -> ExtEntry {
        if descriptor
            .get("deferred")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let name = descriptor
                .get("scene")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let resolver = self.clone();
            return ExtEntry::Factory(Rc::new(move || resolver.construct_scene(&name)));
        }
        if descriptor.get("ext").is_some() || descriptor.get("sub").is_some() {
            // Nested composite constructs with its own tables
            return ExtEntry::Link(self.construct(descriptor));
        }
        let type_name = descriptor
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Unknown");
        let data = self.resolve(
            descriptor.get("data").unwrap_or(&Value::Null),
            &RefTables::default(),
        );
        ExtEntry::Link(self.table.construct(type_name, data))
    }

    fn resolve(
        &self,
        value: &Value,
        tables: &RefTables,
    ) -> Resolved {
        match value {
            Value::Array(items) => {
                if let Some(resolved) = self.resolve_marker(items, tables) {
                    return resolved;
                }
                Resolved::List(items.iter().map(|item| self.resolve(item, tables)).collect())
            }
            Value::Object(map) => Resolved::Map(
                map.iter()
                    .map(|(key, item)| (key.clone(), self.resolve(item, tables)))
                    .collect(),
            ),
            other => Resolved::Raw(other.clone()),
        }
    }

    fn resolve_marker(
        &self,
        items: &[Value],
        tables: &RefTables,
    ) -> Option<Resolved> {
        if items.len() != 2 {
            return None;
        }
        let marker = items[0].as_str()?;
        let index = items[1].as_u64()? as usize;
        match marker {
            EXT_MARKER => Some(match tables.ext.get(index) {
                Some(ExtEntry::Link(link)) => Resolved::Link(link.clone()),
                Some(ExtEntry::Factory(factory)) => Resolved::Deferred(factory.clone()),
                None => {
                    log::error!("ext reference {} out of range", index);
                    Resolved::Raw(Value::Null)
                }
            }),
            SUB_MARKER => Some(match tables.sub.get(index) {
                Some(link) => Resolved::Link(link.clone()),
                None => {
                    log::error!("sub reference {} out of range", index);
                    Resolved::Raw(Value::Null)
                }
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_marker_resolves_to_ext_entry() {
        let resolver = ReferenceResolver::new(ConstructorTable::new());
        let composite = json!({
            "type": "SpriteSheet",
            "ext": [ { "type": "Texture", "data": { "path": "atlas.png" } } ],
            "data": { "frames": { "idle": ["@ext#", 0] } }
        });

        let sheet = resolver.construct(&composite);
        // Two levels deep: data -> frames -> idle
        let idle = sheet.data.get("frames").unwrap().get("idle").unwrap();
        let texture = idle.as_link().unwrap();
        assert_eq!(texture.type_name, "Texture");
        assert_eq!(
            texture.data.get("path").unwrap().as_raw().unwrap(),
            &json!("atlas.png")
        );
    }

    #[test]
    fn ext_entry_with_deeper_references_resolves_recursively() {
        let resolver = ReferenceResolver::new(ConstructorTable::new());
        // ext[0] is itself a composite whose data references its own tables
        // one level deeper
        let composite = json!({
            "type": "Material",
            "ext": [ {
                "type": "Shader",
                "ext": [ { "type": "Texture", "data": { "path": "noise.png" } } ],
                "data": { "sampler": ["@ext#", 0] }
            } ],
            "data": { "shader": ["@ext#", 0] }
        });

        let material = resolver.construct(&composite);
        let shader = material.data.get("shader").unwrap().as_link().unwrap();
        assert_eq!(shader.type_name, "Shader");
        let texture = shader.data.get("sampler").unwrap().as_link().unwrap();
        assert_eq!(texture.type_name, "Texture");
    }

    #[test]
    fn sub_entries_thread_the_ext_table() {
        let resolver = ReferenceResolver::new(ConstructorTable::new());
        let composite = json!({
            "type": "Level",
            "ext": [ { "type": "Texture", "data": {} } ],
            "sub": [ { "type": "Prop", "data": { "skin": ["@ext#", 0] } } ],
            "data": { "props": [ ["@sub#", 0] ] }
        });

        let level = resolver.construct(&composite);
        let prop = level
            .data
            .get("props")
            .unwrap()
            .index(0)
            .unwrap()
            .as_link()
            .unwrap();
        assert_eq!(prop.type_name, "Prop");
        assert_eq!(
            prop.data.get("skin").unwrap().as_link().unwrap().type_name,
            "Texture"
        );
    }

    #[test]
    fn registered_constructor_is_used() {
        let mut table = ConstructorTable::new();
        table.register("Texture", |type_name, data| Constructed {
            type_name: format!("engine::{}", type_name),
            data,
        });
        let resolver = ReferenceResolver::new(table);
        let composite = json!({
            "type": "SpriteSheet",
            "ext": [ { "type": "Texture", "data": {} } ],
            "data": { "tex": ["@ext#", 0] }
        });

        let sheet = resolver.construct(&composite);
        let texture = sheet.data.get("tex").unwrap().as_link().unwrap();
        assert_eq!(texture.type_name, "engine::Texture");
    }

    #[test]
    fn cyclic_scenes_defer_instead_of_recursing() {
        let resolver = ReferenceResolver::new(ConstructorTable::new());
        resolver.register_scene(
            "a",
            json!({
                "type": "Scene",
                "ext": [ { "deferred": true, "scene": "b" } ],
                "data": { "next": ["@ext#", 0], "name": "a" }
            }),
        );
        resolver.register_scene(
            "b",
            json!({
                "type": "Scene",
                "ext": [ { "deferred": true, "scene": "a" } ],
                "data": { "next": ["@ext#", 0], "name": "b" }
            }),
        );

        // Constructing "a" terminates even though a <-> b reference each other
        let scene_a = resolver.construct_scene("a").unwrap();
        let factory = scene_a.data.get("next").unwrap().as_deferred().unwrap();

        // Invoking the factory materializes "b", whose back-reference to "a"
        // is again deferred
        let scene_b = factory().unwrap();
        assert_eq!(
            scene_b.data.get("name").unwrap().as_raw().unwrap(),
            &json!("b")
        );
        assert!(scene_b.data.get("next").unwrap().as_deferred().is_some());
    }

    #[test]
    fn out_of_range_reference_degrades_to_null() {
        let resolver = ReferenceResolver::new(ConstructorTable::new());
        let composite = json!({
            "type": "Broken",
            "ext": [],
            "data": { "missing": ["@ext#", 5] }
        });
        let broken = resolver.construct(&composite);
        assert_eq!(
            broken.data.get("missing").unwrap().as_raw().unwrap(),
            &Value::Null
        );
    }

    #[test]
    fn plain_two_element_arrays_are_not_markers() {
        let resolver = ReferenceResolver::new(ConstructorTable::new());
        let composite = json!({
            "type": "Mesh",
            "data": { "uv": [0.25, 0.75] }
        });
        let mesh = resolver.construct(&composite);
        let uv = mesh.data.get("uv").unwrap();
        assert_eq!(uv.index(0).unwrap().as_raw().unwrap(), &json!(0.25));
    }
}
